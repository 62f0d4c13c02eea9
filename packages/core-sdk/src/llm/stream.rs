use async_stream::try_stream;
use futures_util::{Stream, StreamExt};

use super::sse::SseDecoder;
use super::ChunkStream;
use crate::error::ProviderApiError;
use crate::models::{AIStreamChunk, ProviderName};

/**
 * \brief 厂商事件解码后的统一信号。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamSignal {
    Delta(String),
    Finished,
}

/**
 * \brief 把厂商 SSE 字节流归一化为 AIStreamChunk 序列。
 * \details 无论厂商以何种方式表示结束（finish_reason、终止事件、`[DONE]` 或直接断流），
 *          输出都以恰好一个 done=true 的块结束；空增量不会被转发。
 */
pub(crate) fn normalize<S, B, E, F>(provider: ProviderName, bytes: S, mut decode: F) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
    F: FnMut(&str) -> Result<Vec<StreamSignal>, ProviderApiError> + Send + 'static,
{
    let out = try_stream! {
        let mut bytes = Box::pin(bytes);
        let mut decoder = SseDecoder::new();
        let mut finished = false;

        'read: while let Some(item) = bytes.next().await {
            let chunk = item.map_err(|e| ProviderApiError::new(provider, e.to_string()))?;
            for payload in decoder.push(chunk.as_ref()) {
                for signal in decode(&payload)? {
                    match signal {
                        StreamSignal::Delta(text) => {
                            if !text.is_empty() {
                                yield AIStreamChunk::delta(text);
                            }
                        }
                        StreamSignal::Finished => {
                            finished = true;
                            break 'read;
                        }
                    }
                }
            }
        }

        if !finished {
            if let Some(payload) = decoder.finish() {
                for signal in decode(&payload)? {
                    match signal {
                        StreamSignal::Delta(text) => {
                            if !text.is_empty() {
                                yield AIStreamChunk::delta(text);
                            }
                        }
                        StreamSignal::Finished => break,
                    }
                }
            }
        }

        yield AIStreamChunk::done();
    };
    Box::pin(out)
}
