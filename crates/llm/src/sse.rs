use crate::event::StreamEvent;

const BLOCK_DELIMITER: &[u8] = b"\n\n";
const DATA_FIELD: &str = "data:";

/// Incremental decoder for the `data: {json}\n\n` framing of the chat stream.
///
/// Bytes are buffered raw and only complete blocks are decoded, so a read that
/// ends mid-block (or mid UTF-8 sequence) is simply retained for the next one.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one read and returns every event whose block is now complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        // CR only ever appears as part of a line terminator; JSON escapes it inside strings.
        self.buffer
            .extend(bytes.iter().copied().filter(|byte| *byte != b'\r'));

        let mut events = Vec::new();
        while let Some(position) = find_delimiter(&self.buffer) {
            let block = self
                .buffer
                .drain(..position + BLOCK_DELIMITER.len())
                .collect::<Vec<_>>();
            if let Some(event) = decode_block(&block[..position]) {
                events.push(event);
            }
        }
        events
    }

    /// Decodes whatever is left once the connection has ended.
    ///
    /// The last block of a stream may arrive without its trailing blank line.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let block = std::mem::take(&mut self.buffer);
        decode_block(&block)
    }

    /// Number of bytes held back waiting for a delimiter.
    pub fn pending_len(&self) -> usize {
        self.buffer.len()
    }
}

fn find_delimiter(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(BLOCK_DELIMITER.len())
        .position(|window| window == BLOCK_DELIMITER)
}

fn decode_block(block: &[u8]) -> Option<StreamEvent> {
    let text = match std::str::from_utf8(block) {
        Ok(text) => text,
        Err(error) => {
            tracing::warn!(
                error = %error,
                block_len = block.len(),
                "discarding stream block with invalid utf-8"
            );
            return None;
        }
    };

    let data_lines = text
        .split('\n')
        .filter(|line| !line.starts_with(':'))
        .filter_map(|line| line.strip_prefix(DATA_FIELD))
        .map(|value| value.strip_prefix(' ').unwrap_or(value))
        .collect::<Vec<_>>();

    if data_lines.is_empty() {
        return None;
    }

    let payload = data_lines.join("\n");
    if payload.trim().is_empty() {
        return None;
    }

    match serde_json::from_str::<StreamEvent>(&payload) {
        Ok(event) => Some(event),
        Err(error) => {
            // One malformed event must not abort an otherwise healthy stream.
            tracing::warn!(
                error = %error,
                payload_len = payload.len(),
                "discarding undecodable stream payload"
            );
            None
        }
    }
}
