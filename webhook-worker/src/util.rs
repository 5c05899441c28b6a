//! Streaming response-body truncation: reads at most `n` bytes from a
//! response stream without buffering the whole body, which matters for
//! callbacks that answer with something unexpectedly large.

use futures::StreamExt;
use reqwest::Response;

use webhook_common::error::WebhookError;

pub async fn first_n_bytes_of_response(
    response: Response,
    n: usize,
) -> Result<String, WebhookError> {
    let mut body = response.bytes_stream();
    let mut buffer = String::with_capacity(n);

    while let Some(chunk) = body.next().await {
        if buffer.len() >= n {
            break;
        }

        let chunk = chunk.map_err(|e| WebhookError::Internal(e.to_string()))?;
        let chunk_str =
            std::str::from_utf8(&chunk).map_err(|e| WebhookError::Internal(e.to_string()))?;
        if let Some(partial_chunk_str) =
            chunk_str.get(0..std::cmp::min(n - buffer.len(), chunk_str.len()))
        {
            buffer.push_str(partial_chunk_str);
        } else {
            break;
        }
    }

    Ok(buffer)
}
