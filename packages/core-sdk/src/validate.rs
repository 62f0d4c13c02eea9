//! 按 `tipo` 判别的结构校验；任何失败都以类型化结果返回，不会 panic 或抛出。

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::sanitize::{sanitize_json_response, strip_reasoning};

/// 提示词约定的安全哨兵，出现在任何位置都视为检测到注入。
pub const SECURITY_SENTINEL: &str = "SECURITY_VIOLATION";

/// 澄清问题的数量上限。
pub const MAX_QUESTIONS: usize = 3;

/**
 * \brief 生成任务类型。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Abap,
    FunctionalSpec,
    Debug,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Abap => "abap",
            TaskKind::FunctionalSpec => "functional_spec",
            TaskKind::Debug => "debug",
        }
    }

    /// 该任务的最终产物形状。
    pub fn artifact_kind(&self) -> ArtifactKind {
        match self {
            TaskKind::Abap => ArtifactKind::Codigo,
            TaskKind::FunctionalSpec => ArtifactKind::Documento,
            TaskKind::Debug => ArtifactKind::Solucao,
        }
    }
}

/**
 * \brief 最终产物的 tipo 取值。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Codigo,
    Solucao,
    Documento,
}

impl ArtifactKind {
    pub fn tipo(&self) -> &'static str {
        match self {
            ArtifactKind::Codigo => "codigo",
            ArtifactKind::Solucao => "solucao",
            ArtifactKind::Documento => "documento",
        }
    }

    fn from_tipo(tipo: &str) -> Option<Self> {
        match tipo {
            "codigo" => Some(ArtifactKind::Codigo),
            "solucao" => Some(ArtifactKind::Solucao),
            "documento" => Some(ArtifactKind::Documento),
            _ => None,
        }
    }

    /**
     * \brief 形状特有的必填字段检查。
     */
    fn check(&self, obj: &Map<String, Value>) -> Result<(), String> {
        match self {
            ArtifactKind::Codigo => {
                if non_empty_str(obj.get("codigo_principal")) {
                    Ok(())
                } else {
                    Err("Campo 'codigo_principal' ausente ou vazio".to_string())
                }
            }
            ArtifactKind::Solucao => {
                let missing = ["titulo", "causa_raiz", "solucao"]
                    .into_iter()
                    .filter(|key| !present(obj.get(*key)))
                    .collect::<Vec<_>>();
                if missing.is_empty() {
                    Ok(())
                } else {
                    Err(format!("Campos obrigatórios ausentes: {}", missing.join(", ")))
                }
            }
            ArtifactKind::Documento => {
                if !non_empty_str(obj.get("titulo")) {
                    return Err("Campo 'titulo' ausente ou vazio".to_string());
                }
                match obj.get("secoes").and_then(Value::as_array) {
                    Some(secoes) if !secoes.is_empty() => Ok(()),
                    _ => Err("Campo 'secoes' deve ser uma lista não vazia".to_string()),
                }
            }
        }
    }
}

/**
 * \brief 校验策略：任务类型 + 本轮是否允许提问（精炼轮次不允许）。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationPolicy {
    pub task: TaskKind,
    pub allow_questions: bool,
}

impl ValidationPolicy {
    pub fn initial(task: TaskKind) -> Self {
        Self {
            task,
            allow_questions: true,
        }
    }

    pub fn refinement(task: TaskKind) -> Self {
        Self {
            task,
            allow_questions: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClarifyingQuestion {
    pub pergunta: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contexto: Option<String>,
}

/**
 * \brief 清洗并解析后的模型回复，三种形状互斥。
 */
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedModelResponse {
    /// 需要澄清：1..=3 个问题
    Questions {
        mensagem: String,
        perguntas: Vec<ClarifyingQuestion>,
    },
    /// 最终产物，payload 为完整 JSON 对象
    Artifact { kind: ArtifactKind, payload: Value },
    /// 错误信号；security_violation 表示检测到提示词注入
    Error {
        mensagem: String,
        security_violation: bool,
    },
}

impl ParsedModelResponse {
    pub fn tipo(&self) -> &'static str {
        match self {
            ParsedModelResponse::Questions { .. } => "perguntas",
            ParsedModelResponse::Artifact { kind, .. } => kind.tipo(),
            ParsedModelResponse::Error { .. } => "erro",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ParsedModelResponse::Error { .. })
    }

    fn data(&self) -> Value {
        match self {
            ParsedModelResponse::Questions {
                mensagem,
                perguntas,
            } => json!({ "mensagem": mensagem, "perguntas": perguntas }),
            ParsedModelResponse::Artifact { payload, .. } => payload.clone(),
            ParsedModelResponse::Error {
                mensagem,
                security_violation,
            } => json!({ "mensagem": mensagem, "security_violation": security_violation }),
        }
    }
}

/**
 * \brief 校验失败；candidate 保留最后一次候选文本便于诊断。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationFailure {
    pub error: String,
    /** \brief 底层解析器的错误信息（若有） */
    pub detail: Option<String>,
    pub candidate: String,
}

impl ValidationFailure {
    fn shape(error: impl Into<String>, candidate: &str) -> Self {
        Self {
            error: error.into(),
            detail: None,
            candidate: candidate.to_string(),
        }
    }
}

pub type ValidationOutcome = Result<ParsedModelResponse, ValidationFailure>;

/**
 * \brief 清洗、解析并按策略校验模型原始输出。
 * \details 去除推理区段后先检查哨兵，再解析；解析失败时再清洗重试一次。
 */
pub fn validate_response(raw: &str, policy: ValidationPolicy) -> ValidationOutcome {
    // 推理区段不参与判定
    if strip_reasoning(raw).contains(SECURITY_SENTINEL) {
        return Ok(ParsedModelResponse::Error {
            mensagem: "Possível tentativa de manipulação detectada na entrada".to_string(),
            security_violation: true,
        });
    }

    let first = sanitize_json_response(raw);
    let (value, candidate) = match serde_json::from_str::<Value>(&first) {
        Ok(value) => (value, first),
        Err(_) => {
            let second = sanitize_json_response(&first);
            match serde_json::from_str::<Value>(&second) {
                Ok(value) => (value, second),
                Err(err) => {
                    return Err(ValidationFailure {
                        error: "A resposta da IA não é um JSON válido".to_string(),
                        detail: Some(err.to_string()),
                        candidate: second,
                    });
                }
            }
        }
    };

    validate_value(&value, policy).map_err(|error| ValidationFailure::shape(error, &candidate))
}

/**
 * \brief 对已解析的 JSON 做结构校验。
 */
pub fn validate_value(value: &Value, policy: ValidationPolicy) -> Result<ParsedModelResponse, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "A resposta deve ser um objeto JSON".to_string())?;
    let tipo = obj
        .get("tipo")
        .and_then(Value::as_str)
        .map(str::trim)
        .ok_or_else(|| "Campo 'tipo' ausente".to_string())?;

    match tipo {
        "perguntas" => {
            if !policy.allow_questions {
                return Err("Perguntas não são permitidas nesta etapa; esperado o resultado final".to_string());
            }
            let expected = policy.task.artifact_kind();
            if expected.check(obj).is_ok() {
                return Err(format!(
                    "Resposta ambígua: contém perguntas e '{}' ao mesmo tempo",
                    expected.tipo()
                ));
            }
            validate_questions(obj)
        }
        "erro" => Ok(ParsedModelResponse::Error {
            mensagem: obj
                .get("mensagem")
                .and_then(Value::as_str)
                .unwrap_or("Erro informado pela IA")
                .to_string(),
            security_violation: false,
        }),
        other => {
            let kind = ArtifactKind::from_tipo(other)
                .ok_or_else(|| format!("Tipo de resposta desconhecido: '{}'", other))?;
            let expected = policy.task.artifact_kind();
            if kind != expected {
                return Err(format!(
                    "Tipo '{}' não corresponde à tarefa (esperado '{}')",
                    other,
                    expected.tipo()
                ));
            }
            kind.check(obj)?;
            Ok(ParsedModelResponse::Artifact {
                kind,
                payload: value.clone(),
            })
        }
    }
}

fn validate_questions(obj: &Map<String, Value>) -> Result<ParsedModelResponse, String> {
    let items = obj
        .get("perguntas")
        .and_then(Value::as_array)
        .ok_or_else(|| "Campo 'perguntas' ausente ou não é uma lista".to_string())?;
    if items.is_empty() {
        return Err("A lista de perguntas está vazia".to_string());
    }
    if items.len() > MAX_QUESTIONS {
        return Err(format!(
            "Número de perguntas acima do limite: {} (máximo {})",
            items.len(),
            MAX_QUESTIONS
        ));
    }
    let perguntas = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let pergunta = item
                .get("pergunta")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| format!("Pergunta {} sem o campo 'pergunta'", i + 1))?;
            Ok(ClarifyingQuestion {
                pergunta: pergunta.to_string(),
                contexto: item
                    .get("contexto")
                    .and_then(Value::as_str)
                    .map(|c| c.to_string()),
            })
        })
        .collect::<Result<Vec<_>, String>>()?;
    Ok(ParsedModelResponse::Questions {
        mensagem: obj
            .get("mensagem")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        perguntas,
    })
}

fn present(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

fn non_empty_str(value: Option<&Value>) -> bool {
    value
        .and_then(Value::as_str)
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false)
}

/**
 * \brief 可序列化的校验报告，作为 SSE done 事件的载荷。
 */
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub is_valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tipo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "erroDetalhado", skip_serializing_if = "Option::is_none")]
    pub erro_detalhado: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,
}

impl From<&ValidationOutcome> for ValidationReport {
    fn from(outcome: &ValidationOutcome) -> Self {
        match outcome {
            Ok(parsed) => ValidationReport {
                is_valid: true,
                tipo: Some(parsed.tipo().to_string()),
                data: Some(parsed.data()),
                error: None,
                erro_detalhado: None,
                candidate: None,
            },
            Err(failure) => ValidationReport {
                is_valid: false,
                tipo: None,
                data: None,
                error: Some(failure.error.clone()),
                erro_detalhado: failure.detail.clone(),
                candidate: Some(failure.candidate.clone()),
            },
        }
    }
}
