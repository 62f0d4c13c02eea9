/**
 * \brief 增量 SSE 解码器：按空行切分事件，返回每个事件的 data 字段。
 * \details 容忍 `\r\n` 行尾、多行 data、注释行，以及流末尾未以空行结束的事件。
 */
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加字节，返回本次凑齐的所有事件 data。
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf
            .extend(bytes.iter().copied().filter(|b| *b != b'\r'));
        let mut out = Vec::new();
        while let Some(pos) = find_double_newline(&self.buf) {
            let block = self.buf.drain(..pos + 2).collect::<Vec<u8>>();
            if let Some(data) = extract_data(&block) {
                out.push(data);
            }
        }
        out
    }

    /// 流结束时处理残留的最后一个事件。
    pub fn finish(&mut self) -> Option<String> {
        let block = std::mem::take(&mut self.buf);
        extract_data(&block)
    }
}

fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn extract_data(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let lines = text
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|line| line.strip_prefix(' ').unwrap_or(line))
        .collect::<Vec<_>>();
    if lines.is_empty() {
        return None;
    }
    let data = lines.join("\n");
    let data = data.trim();
    if data.is_empty() {
        None
    } else {
        Some(data.to_string())
    }
}
