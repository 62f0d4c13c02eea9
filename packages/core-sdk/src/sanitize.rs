//! 从模型原始输出中恢复可解析 JSON 的清洗流水线。
//!
//! 阶段顺序固定：推理痕迹 → Markdown 代码块 → 首尾花括号裁剪 → 控制字符处理
//! → 贪婪候选 → 括号配平 → 兜底返回裁剪结果。

use once_cell::sync::Lazy;
use regex::Regex;

/// 推理区段的标签名。
const REASONING_TAGS: &str = "think|thinking|reasoning";

/// 贪婪候选的最大尝试次数。
const MAX_GREEDY_ATTEMPTS: usize = 256;

static CLOSED_REASONING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?is)<(?:{tags})>.*?</(?:{tags})>|\[(?:{tags})\].*?\[/(?:{tags})\]",
        tags = REASONING_TAGS
    ))
    .expect("Invalid closed reasoning regex")
});

static UNCLOSED_REASONING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?is)(?:<(?:{tags})>|\[(?:{tags})\]).*\z",
        tags = REASONING_TAGS
    ))
    .expect("Invalid unclosed reasoning regex")
});

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)```(?:json)?").expect("Invalid code fence regex"));

/**
 * \brief 字符串感知扫描器的状态。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// 字符串字面量之外
    Normal,
    /// 双引号字符串之内
    InString,
    /// 字符串内刚读到反斜杠
    EscapePending,
}

/**
 * \brief 执行完整流水线。
 * \return 可解析的 JSON；全部阶段失败时返回裁剪并处理过控制字符的文本
 */
pub fn sanitize_json_response(raw: &str) -> String {
    if is_json(raw) {
        return raw.to_string();
    }

    let without_reasoning = strip_reasoning(raw);
    if is_json(&without_reasoning) {
        return without_reasoning;
    }

    let without_fences = strip_code_fences(&without_reasoning);
    let trimmed = trim_to_braces(&without_fences);
    let cleaned = escape_control_chars(trimmed);
    if is_json_object(&cleaned) {
        return cleaned;
    }

    if let Some(candidate) = extract_greedy(&cleaned) {
        return candidate.to_string();
    }
    if let Some(candidate) = extract_balanced(&cleaned) {
        if is_json_object(candidate) {
            return candidate.to_string();
        }
    }
    cleaned
}

/**
 * \brief 阶段 1：去除推理区段；未闭合的开标签一直删到文本末尾。
 */
pub fn strip_reasoning(text: &str) -> String {
    let closed = CLOSED_REASONING.replace_all(text, "");
    UNCLOSED_REASONING.replace(&closed, "").into_owned()
}

/**
 * \brief 阶段 2：去除 ```json / ``` 围栏。
 */
pub fn strip_code_fences(text: &str) -> String {
    CODE_FENCE.replace_all(text, "").into_owned()
}

/**
 * \brief 阶段 3：丢弃第一个 `{` 之前与最后一个 `}` 之后的内容。
 * \details 没有位于其后的 `}` 时（输出被截断），只去掉前缀。
 */
pub fn trim_to_braces(text: &str) -> &str {
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if end > start => &text[start..=end],
        (Some(start), _) => text[start..].trim_end(),
        (None, _) => text.trim(),
    }
}

/**
 * \brief 阶段 4：单遍扫描处理控制字符。
 * \details 字符串内把换行、回车、制表符改写为转义形式，其余 C0 控制字符改写为 `\u00XX`；
 *          字符串外删除非空白的 C0、DEL 与 C1 控制字符；已有转义序列整体保留。
 */
pub fn escape_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut state = ScanState::Normal;
    for ch in text.chars() {
        state = scan_step(state, ch, &mut out);
    }
    out
}

/**
 * \brief 扫描器的单步转移，写出该字符对应的输出。
 */
pub fn scan_step(state: ScanState, ch: char, out: &mut String) -> ScanState {
    match state {
        ScanState::Normal => match ch {
            '"' => {
                out.push(ch);
                ScanState::InString
            }
            c if is_stray_control(c) => ScanState::Normal,
            c => {
                out.push(c);
                ScanState::Normal
            }
        },
        ScanState::InString => match ch {
            '\\' => {
                out.push(ch);
                ScanState::EscapePending
            }
            '"' => {
                out.push(ch);
                ScanState::Normal
            }
            '\n' => {
                out.push_str("\\n");
                ScanState::InString
            }
            '\r' => {
                out.push_str("\\r");
                ScanState::InString
            }
            '\t' => {
                out.push_str("\\t");
                ScanState::InString
            }
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
                ScanState::InString
            }
            c => {
                out.push(c);
                ScanState::InString
            }
        },
        ScanState::EscapePending => {
            out.push(ch);
            ScanState::InString
        }
    }
}

fn is_stray_control(c: char) -> bool {
    matches!(c as u32, 0x00..=0x08 | 0x0B..=0x0C | 0x0E..=0x1F | 0x7F..=0x9F)
}

/**
 * \brief 阶段 5：返回第一个完整配平的 `{...}`；字符串内的花括号不计深度。
 */
pub fn extract_balanced(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut state = ScanState::Normal;
    for (offset, ch) in text[start..].char_indices() {
        state = match state {
            ScanState::Normal => match ch {
                '"' => ScanState::InString,
                '{' => {
                    depth += 1;
                    ScanState::Normal
                }
                '}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        return Some(&text[start..start + offset + 1]);
                    }
                    ScanState::Normal
                }
                _ => ScanState::Normal,
            },
            ScanState::InString => match ch {
                '\\' => ScanState::EscapePending,
                '"' => ScanState::Normal,
                _ => ScanState::InString,
            },
            ScanState::EscapePending => ScanState::InString,
        };
    }
    None
}

/**
 * \brief 阶段 6：按起点从前到后、终点从后到前枚举 `{...}` 区间，返回第一个可解析的对象。
 */
pub fn extract_greedy(text: &str) -> Option<&str> {
    let ends = text
        .match_indices('}')
        .map(|(i, _)| i)
        .collect::<Vec<_>>();
    let mut attempts = 0usize;
    for (start, _) in text.match_indices('{') {
        for &end in ends.iter().rev() {
            if end < start {
                break;
            }
            attempts += 1;
            if attempts > MAX_GREEDY_ATTEMPTS {
                return None;
            }
            let candidate = &text[start..=end];
            if is_json_object(candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

fn is_json(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text).is_ok()
}

fn is_json_object(text: &str) -> bool {
    matches!(
        serde_json::from_str::<serde_json::Value>(text),
        Ok(serde_json::Value::Object(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn parse(text: &str) -> Value {
        serde_json::from_str(text).expect("sanitized output should parse")
    }

    #[test]
    fn test_valid_json_is_returned_unchanged() {
        let inputs = [
            r#"{"tipo":"codigo","codigo_principal":"REPORT z."}"#,
            "{\n  \"a\": [1, 2, {\"b\": null}],\n  \"c\": \"<thinking>x</thinking>\"\n}",
            r#"  {"x": "a{b}c"}  "#,
            "[1,2,3]",
            r#""texto""#,
            "{\"c1\":\"\u{85}\"}",
        ];
        for input in inputs {
            assert_eq!(sanitize_json_response(input), input);
        }
    }

    #[test]
    fn test_fenced_json_with_prose() {
        let raw = "Here's the result:\n```json\n{\"tipo\":\"codigo\",\"codigo_principal\":\"REPORT z_test.\"}\n```\nHope that helps!";
        assert_eq!(
            sanitize_json_response(raw),
            r#"{"tipo":"codigo","codigo_principal":"REPORT z_test."}"#
        );
    }

    #[test]
    fn test_reasoning_trace_contributes_nothing() {
        let json = r#"{"tipo":"perguntas","perguntas":[{"pergunta":"A?"}]}"#;
        let traces = [
            "<thinking>consider {\"tipo\": \"codigo\"} first }}}</thinking>",
            "<think>{{{ nested</think>",
            "[thinking]plan: {a}[/thinking]",
            "<REASONING>x</REASONING>",
        ];
        for prefix in ["", "Resposta:\n", "ok "] {
            for trace in traces {
                let with_trace = format!("{}{}{}", prefix, trace, json);
                let without = format!("{}{}", prefix, json);
                assert_eq!(
                    sanitize_json_response(&with_trace),
                    sanitize_json_response(&without),
                    "trace {:?} with prefix {:?}",
                    trace,
                    prefix
                );
            }
        }
    }

    #[test]
    fn test_unclosed_trace_truncated() {
        let json = r#"{"tipo":"codigo","codigo_principal":"WRITE 'x'."}"#;
        for opener in ["<thinking>", "<think>", "[think]"] {
            let raw = format!("{}{}wait, maybe {{\"tipo\": \"err", json, opener);
            assert_eq!(sanitize_json_response(&raw), json);
        }
    }

    #[test]
    fn test_newline_inside_string_round_trips() {
        let raw = "{\"codigo_principal\": \"REPORT z.\nWRITE 'oi'.\",\n\"tipo\": \"codigo\"}";
        let out = sanitize_json_response(raw);
        assert!(out.contains("\\n"));
        let value = parse(&out);
        assert_eq!(value["codigo_principal"], "REPORT z.\nWRITE 'oi'.");
        // 词法单元之间的格式化换行保留
        assert!(out.contains(",\n\"tipo\""));
    }

    #[test]
    fn test_stray_controls_between_tokens_removed() {
        let raw = "{\"a\":\u{1}1,\u{0b}\"b\":\u{9b}\"x\"}";
        let out = sanitize_json_response(raw);
        assert_eq!(out, "{\"a\":1,\"b\":\"x\"}");
    }

    #[test]
    fn test_scanner_transitions_table() {
        let cases: [(ScanState, char, &str, ScanState); 12] = [
            (ScanState::Normal, '"', "\"", ScanState::InString),
            (ScanState::Normal, '{', "{", ScanState::Normal),
            (ScanState::Normal, '\n', "\n", ScanState::Normal),
            (ScanState::Normal, '\t', "\t", ScanState::Normal),
            (ScanState::Normal, '\u{7}', "", ScanState::Normal),
            (ScanState::Normal, '\u{90}', "", ScanState::Normal),
            (ScanState::InString, '\n', "\\n", ScanState::InString),
            (ScanState::InString, '\r', "\\r", ScanState::InString),
            (ScanState::InString, '\t', "\\t", ScanState::InString),
            (ScanState::InString, '\\', "\\", ScanState::EscapePending),
            (ScanState::InString, '"', "\"", ScanState::Normal),
            (ScanState::EscapePending, '"', "\"", ScanState::InString),
        ];
        for (state, ch, expected_out, expected_state) in cases {
            let mut out = String::new();
            let next = scan_step(state, ch, &mut out);
            assert_eq!(out, expected_out, "{:?} + {:?}", state, ch);
            assert_eq!(next, expected_state, "{:?} + {:?}", state, ch);
        }
    }

    #[test]
    fn test_escaped_sequences_pass_through() {
        let input = r#"{"a":"x\"y\\","b":"\n"}"#;
        assert_eq!(escape_control_chars(input), input);
        let mut out = String::new();
        assert_eq!(
            scan_step(ScanState::InString, '\u{1}', &mut out),
            ScanState::InString
        );
        assert_eq!(out, "\\u0001");
    }

    #[test]
    fn test_balanced_ignores_braces_in_strings() {
        let text = r#"prefix {"k":"a{b}c","n":{"m":"}"}} tail {"x":1}"#;
        assert_eq!(
            extract_balanced(text),
            Some(r#"{"k":"a{b}c","n":{"m":"}"}}"#)
        );
        assert_eq!(extract_balanced("{\"a\": \"unterminated"), None);
        assert_eq!(extract_balanced("no braces"), None);
    }

    #[test]
    fn test_greedy_prefers_largest_parseable_span() {
        let text = r#"{"k":"a{b}c"} trailing }"#;
        assert_eq!(extract_greedy(text), Some(r#"{"k":"a{b}c"}"#));

        let nested = r#"{"outer":{"inner":"}"}}"#;
        assert_eq!(extract_greedy(nested), Some(nested));

        let two = r#"{"a":1} and then {"b":2}"#;
        assert_eq!(extract_greedy(two), Some(r#"{"a":1}"#));
    }

    #[test]
    fn test_pipeline_uses_greedy_for_trailing_brace_noise() {
        let raw = "Resultado: {\"tipo\":\"codigo\",\"codigo_principal\":\"a{b}c\"} obs: use }";
        let out = sanitize_json_response(raw);
        assert_eq!(out, r#"{"tipo":"codigo","codigo_principal":"a{b}c"}"#);
    }

    #[test]
    fn test_unrecoverable_returns_trimmed_candidate() {
        let raw = "texto {\"tipo\": \"codigo\", \"codigo_principal\": } fim";
        assert_eq!(
            sanitize_json_response(raw),
            "{\"tipo\": \"codigo\", \"codigo_principal\": }"
        );
        assert_eq!(sanitize_json_response("  sem json  "), "sem json");
    }

    #[test]
    fn test_truncated_output_loses_prose_prefix() {
        let raw = "Aqui está o resultado:\n{\"tipo\": \"codigo\", \"codigo_principal\": \"REPORT z.";
        assert_eq!(
            sanitize_json_response(raw),
            "{\"tipo\": \"codigo\", \"codigo_principal\": \"REPORT z."
        );
    }

    #[test]
    fn test_trim_to_braces() {
        assert_eq!(trim_to_braces("a {x} b"), "{x}");
        assert_eq!(trim_to_braces("} {"), "{");
        assert_eq!(
            trim_to_braces("Resultado: {\"tipo\":\"codigo\",\"codigo\":\"RE  \n"),
            "{\"tipo\":\"codigo\",\"codigo\":\"RE"
        );
        assert_eq!(trim_to_braces("  sem json  "), "sem json");
        assert_eq!(strip_code_fences("```JSON\n{}\n```"), "\n{}\n");
    }
}
