use super::forms::{DebugReportForm, QuestionAnswer};
use super::{decision_rules, field, refinement_rules, security_rules};

const SOLUTION_SCHEMA: &str = r#"{"tipo":"solucao","titulo":"<resumo do problema>","causa_raiz":"<causa raiz identificada>","solucao":"<passos para corrigir>","codigo_corrigido":"<trecho ABAP corrigido, se aplicável>","prevencao":"<como evitar recorrência>"}"#;

const ANALYSIS_RULES: &str = "REGRAS DE ANÁLISE:\n\
    - Identifique a causa raiz, não apenas o sintoma.\n\
    - Relacione a mensagem de erro (ST22, SM21, mensagens de classe) ao trecho de código envolvido.\n\
    - Só proponha código corrigido quando o código original tiver sido fornecido.\n";

fn form_block(form: &DebugReportForm) -> String {
    let mut out = String::from("DADOS DO USUÁRIO:\n");
    out.push_str(&field("Título", Some(&form.title)));
    out.push_str(&field("Mensagem de erro", Some(&form.error_message)));
    out.push_str(&field("Transação", form.transaction.as_deref()));
    out.push_str(&field("Passos para reproduzir", form.reproduction_steps.as_deref()));
    out.push_str(&field("Comportamento esperado", form.expected_behavior.as_deref()));
    match form.code.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        Some(code) => out.push_str(&format!("- Código:\n<<<\n{}\n>>>\n", code)),
        None => out.push_str(&field("Código", None)),
    }
    out
}

pub fn build_debug_prompt(form: &DebugReportForm) -> String {
    [
        "TAREFA: diagnosticar um erro em um sistema SAP.\n".to_string(),
        security_rules(),
        ANALYSIS_RULES.to_string(),
        decision_rules(SOLUTION_SCHEMA),
        form_block(form),
    ]
    .join("\n")
}

pub fn build_debug_refinement_prompt(form: &DebugReportForm, answers: &[QuestionAnswer]) -> String {
    [
        "TAREFA: entregar o diagnóstico final do erro SAP descrito abaixo.\n".to_string(),
        security_rules(),
        ANALYSIS_RULES.to_string(),
        form_block(form),
        refinement_rules(SOLUTION_SCHEMA, answers),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_is_fenced_when_present() {
        let form = DebugReportForm {
            title: "Dump".into(),
            error_message: "CX_SY_ZERODIVIDE".into(),
            code: Some("lv_x = 1 / 0.".into()),
            ..Default::default()
        };
        let prompt = build_debug_prompt(&form);
        assert!(prompt.contains("<<<\nlv_x = 1 / 0.\n>>>"));
        assert!(prompt.contains("causa_raiz"));
    }
}
