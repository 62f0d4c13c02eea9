use serde::{Deserialize, Serialize};

/**
 * \brief ABAP 代码生成表单。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbapSpecForm {
    /** \brief 程序/类名，例如 Z_REPORT_VENDAS */
    #[serde(rename = "nome_programa")]
    pub program_name: String,
    /** \brief report / classe / módulo de função ... */
    #[serde(rename = "tipo_programa", default)]
    pub program_type: Option<String>,
    #[serde(rename = "modulo_sap", default)]
    pub sap_module: Option<String>,
    #[serde(rename = "descricao")]
    pub description: String,
    #[serde(rename = "regras_negocio", default)]
    pub business_rules: Option<String>,
    #[serde(rename = "tabelas", default)]
    pub tables: Vec<String>,
    #[serde(rename = "tela_selecao", default)]
    pub selection_screen: Option<String>,
    #[serde(rename = "saida", default)]
    pub output: Option<String>,
}

/**
 * \brief ABAP 编码风格。
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbapStyle {
    #[default]
    #[serde(rename = "oo")]
    ObjectOriented,
    #[serde(rename = "procedural")]
    Procedural,
}

/**
 * \brief 功能规格文档表单。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionalSpecForm {
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "modulo_sap", default)]
    pub sap_module: Option<String>,
    #[serde(rename = "objetivo")]
    pub objective: String,
    #[serde(rename = "processo_atual", default)]
    pub current_process: Option<String>,
    #[serde(rename = "requisitos", default)]
    pub requirements: Vec<String>,
    #[serde(rename = "regras_negocio", default)]
    pub business_rules: Option<String>,
    #[serde(rename = "integracoes", default)]
    pub integrations: Option<String>,
    #[serde(rename = "criterios_aceite", default)]
    pub acceptance_criteria: Option<String>,
}

/**
 * \brief 调试报告表单：报错信息 + 可选的代码与复现步骤。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugReportForm {
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "mensagem_erro")]
    pub error_message: String,
    #[serde(rename = "codigo", default)]
    pub code: Option<String>,
    #[serde(rename = "transacao", default)]
    pub transaction: Option<String>,
    #[serde(rename = "passos_reproducao", default)]
    pub reproduction_steps: Option<String>,
    #[serde(rename = "comportamento_esperado", default)]
    pub expected_behavior: Option<String>,
}

/**
 * \brief 上一轮澄清问题及用户回答。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionAnswer {
    pub pergunta: String,
    pub resposta: String,
}
