use super::forms::{AbapSpecForm, AbapStyle, QuestionAnswer};
use super::{decision_rules, field, list_field, refinement_rules, security_rules};

const CODE_SCHEMA: &str = r#"{"tipo":"codigo","codigo_principal":"<código ABAP completo>","explicacao":"<resumo da solução>","objetos_adicionais":[{"nome":"...","tipo":"...","codigo":"..."}],"observacoes":["..."]}"#;

fn style_rules(style: AbapStyle) -> &'static str {
    match style {
        AbapStyle::ObjectOriented => {
            "ESTILO: ABAP Orientado a Objetos.\n\
             - Encapsule a lógica em classes locais (DEFINITION/IMPLEMENTATION) com responsabilidade única.\n\
             - Use exceções baseadas em classe (CX_*) em vez de SY-SUBRC para erros de negócio.\n\
             - Prefira sintaxe moderna (DATA(...), VALUE #( ), NEW #( ), expressões de tabela).\n"
        }
        AbapStyle::Procedural => {
            "ESTILO: ABAP Procedural.\n\
             - Organize o programa em eventos (INITIALIZATION, START-OF-SELECTION) e FORM/PERFORM bem nomeados.\n\
             - Verifique SY-SUBRC após cada acesso a banco e chamada de função.\n\
             - Declare dados globais apenas quando necessário.\n"
        }
    }
}

const BEST_PRACTICES: &str = "BOAS PRÁTICAS OBRIGATÓRIAS:\n\
    - Nomes no namespace do cliente (Z* ou Y*).\n\
    - Nunca use SELECT dentro de LOOP; use FOR ALL ENTRIES ou JOIN.\n\
    - Selecione apenas os campos necessários; nunca SELECT *.\n\
    - Trate textos em elementos de texto, sem literais fixos na tela.\n\
    - Verifique autorizações (AUTHORITY-CHECK) quando houver dados sensíveis.\n";

fn form_block(form: &AbapSpecForm, style: AbapStyle) -> String {
    let mut out = String::from("DADOS DO USUÁRIO:\n");
    out.push_str(&field("Nome do programa", Some(&form.program_name)));
    out.push_str(&field("Tipo de programa", form.program_type.as_deref()));
    out.push_str(&field("Módulo SAP", form.sap_module.as_deref()));
    out.push_str(&field("Descrição", Some(&form.description)));
    out.push_str(&field("Regras de negócio", form.business_rules.as_deref()));
    out.push_str(&list_field("Tabelas", &form.tables));
    out.push_str(&field("Tela de seleção", form.selection_screen.as_deref()));
    out.push_str(&field("Saída esperada", form.output.as_deref()));
    out.push_str(&field(
        "Estilo",
        Some(match style {
            AbapStyle::ObjectOriented => "orientado a objetos",
            AbapStyle::Procedural => "procedural",
        }),
    ));
    out
}

/**
 * \brief 首轮 ABAP 生成提示词。
 */
pub fn build_abap_prompt(form: &AbapSpecForm, style: AbapStyle) -> String {
    [
        "TAREFA: gerar código ABAP a partir da especificação abaixo.\n".to_string(),
        security_rules(),
        style_rules(style).to_string(),
        BEST_PRACTICES.to_string(),
        decision_rules(CODE_SCHEMA),
        form_block(form, style),
    ]
    .join("\n")
}

/**
 * \brief 精炼轮次：带上一轮的问答，只允许输出代码。
 */
pub fn build_abap_refinement_prompt(
    form: &AbapSpecForm,
    style: AbapStyle,
    answers: &[QuestionAnswer],
) -> String {
    [
        "TAREFA: gerar a versão final do código ABAP usando a especificação e as respostas abaixo.\n"
            .to_string(),
        security_rules(),
        style_rules(style).to_string(),
        BEST_PRACTICES.to_string(),
        form_block(form, style),
        refinement_rules(CODE_SCHEMA, answers),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_style_variants_differ() {
        let form = AbapSpecForm {
            program_name: "Z_TESTE".into(),
            description: "x".into(),
            ..Default::default()
        };
        let oo = build_abap_prompt(&form, AbapStyle::ObjectOriented);
        let proc = build_abap_prompt(&form, AbapStyle::Procedural);
        assert!(oo.contains("Orientado a Objetos"));
        assert!(proc.contains("FORM/PERFORM"));
        assert!(oo.contains("codigo_principal"));
        assert!(proc.contains("Tabelas: (não informado)"));
    }
}
