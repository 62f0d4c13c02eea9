use super::forms::{FunctionalSpecForm, QuestionAnswer};
use super::{decision_rules, field, list_field, refinement_rules, security_rules};

const DOCUMENT_SCHEMA: &str = r#"{"tipo":"documento","titulo":"<título da especificação>","secoes":[{"titulo":"Objetivo","conteudo":"..."},{"titulo":"Escopo","conteudo":"..."},{"titulo":"Regras de Negócio","conteudo":"..."},{"titulo":"Critérios de Aceite","conteudo":"..."}]}"#;

const WRITING_RULES: &str = "REGRAS DE REDAÇÃO:\n\
    - Linguagem funcional, sem detalhes de implementação ABAP.\n\
    - Cada requisito deve ser verificável por um critério de aceite.\n\
    - Cite transações, tabelas e objetos SAP pelo nome técnico quando conhecidos.\n";

fn form_block(form: &FunctionalSpecForm) -> String {
    let mut out = String::from("DADOS DO USUÁRIO:\n");
    out.push_str(&field("Título", Some(&form.title)));
    out.push_str(&field("Módulo SAP", form.sap_module.as_deref()));
    out.push_str(&field("Objetivo", Some(&form.objective)));
    out.push_str(&field("Processo atual", form.current_process.as_deref()));
    out.push_str(&list_field("Requisitos", &form.requirements));
    out.push_str(&field("Regras de negócio", form.business_rules.as_deref()));
    out.push_str(&field("Integrações", form.integrations.as_deref()));
    out.push_str(&field("Critérios de aceite", form.acceptance_criteria.as_deref()));
    out
}

pub fn build_functional_spec_prompt(form: &FunctionalSpecForm) -> String {
    [
        "TAREFA: redigir uma especificação funcional SAP.\n".to_string(),
        security_rules(),
        WRITING_RULES.to_string(),
        decision_rules(DOCUMENT_SCHEMA),
        form_block(form),
    ]
    .join("\n")
}

pub fn build_functional_spec_refinement_prompt(
    form: &FunctionalSpecForm,
    answers: &[QuestionAnswer],
) -> String {
    [
        "TAREFA: redigir a versão final da especificação funcional SAP.\n".to_string(),
        security_rules(),
        WRITING_RULES.to_string(),
        form_block(form),
        refinement_rules(DOCUMENT_SCHEMA, answers),
    ]
    .join("\n")
}
