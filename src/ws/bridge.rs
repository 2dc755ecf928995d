use std::process::Stdio;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How often to send WebSocket Ping frames.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
pub const PONG_TIMEOUT: Duration = Duration::from_secs(60);

const READ_CHUNK: usize = 8 * 1024;

/// Whether client frames are written to the child's stdin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Forward,
    Ignore,
}

/// Send a single error frame and close. Used when a request is rejected
/// before any process is spawned.
pub async fn reject(mut socket: WebSocket, message: &str) {
    let _ = socket.send(Message::Text(message.to_string().into())).await;
    let _ = socket.send(Message::Close(None)).await;
}

/// Spawn `command` and pump its output into the socket until the process
/// exits, the peer goes away, or keepalive fails.
///
/// stdout and stderr are merged into text frames. With [`Input::Forward`],
/// text and binary frames from the client are written to stdin. The child
/// is killed when the loop ends, whichever side finished first.
pub async fn run_process(
    socket: WebSocket,
    mut command: Command,
    input: Input,
    endpoint: &str,
) {
    command
        .stdin(match input {
            Input::Forward => Stdio::piped(),
            Input::Ignore => Stdio::null(),
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(endpoint, error = %e, "Failed to spawn socket process");
            reject(socket, &format!("Failed to start process: {}", e)).await;
            return;
        }
    };

    let (out_tx, out_rx) = mpsc::channel::<String>(64);
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump(stdout, out_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump(stderr, out_tx.clone()));
    }
    // Only the pump tasks hold senders now, so `recv` yields None once both
    // pipes close.
    drop(out_tx);

    let stdin = child.stdin.take();
    run_socket_loop(socket, out_rx, stdin, endpoint).await;

    if let Err(e) = child.start_kill() {
        debug!(endpoint, error = %e, "Socket process already exited");
    }
    let _ = child.wait().await;
}

/// Read `reader` to EOF, sending decoded text. A multibyte character split
/// across reads is held back until its remaining bytes arrive.
async fn pump<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<String>) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        pending.extend_from_slice(&buf[..n]);
        let text = take_utf8(&mut pending);
        if !text.is_empty() && tx.send(text).await.is_err() {
            return;
        }
    }
    if !pending.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&pending).into_owned()).await;
    }
}

/// Drain the decodable prefix of `pending`. Invalid sequences become U+FFFD;
/// an incomplete trailing sequence stays in the buffer.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(s) => {
                out.push_str(s);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(std::str::from_utf8(&pending[..valid]).unwrap_or_default());
                match e.error_len() {
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + len);
                    }
                }
            }
        }
    }
}

/// Drive one connection: forward process output, feed client input, and
/// fold ping/pong health checking into the same select loop. If no Pong is
/// received within [`PONG_TIMEOUT`] after a Ping is sent, the connection is
/// considered dead and the loop exits.
pub async fn run_socket_loop(
    socket: WebSocket,
    mut output: mpsc::Receiver<String>,
    mut stdin: Option<tokio::process::ChildStdin>,
    endpoint: &str,
) {
    let (mut sender, mut receiver) = socket.split();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately; consume it so the first real
    // ping fires after PING_INTERVAL has elapsed.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!(endpoint, "Pong timeout, closing socket");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Process output ──────────────────────────────────────
            chunk = output.recv() => {
                match chunk {
                    Some(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // Both pipes closed: the process is done.
                    None => break,
                }
            }

            // ── Client frames ───────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Text(text))) => {
                        write_input(&mut stdin, text.as_str().as_bytes(), endpoint).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        write_input(&mut stdin, &data, endpoint).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

async fn write_input(
    stdin: &mut Option<tokio::process::ChildStdin>,
    data: &[u8],
    endpoint: &str,
) {
    let Some(pipe) = stdin.as_mut() else {
        return;
    };
    let result = async {
        pipe.write_all(data).await?;
        pipe.flush().await
    }
    .await;
    if let Err(e) = result {
        debug!(endpoint, error = %e, "Process stdin closed");
        *stdin = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_constants() {
        // PONG_TIMEOUT must be greater than PING_INTERVAL so we don't
        // immediately consider a fresh connection dead.
        assert!(PONG_TIMEOUT > PING_INTERVAL);
        assert_eq!(PING_INTERVAL, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_pump_forwards_all_bytes_then_closes() {
        let (tx, mut rx) = mpsc::channel(8);
        let data: &[u8] = b"line one\nline two\n";
        pump(data, tx).await;

        let mut collected = String::new();
        while let Some(chunk) = rx.recv().await {
            collected.push_str(&chunk);
        }
        assert_eq!(collected.as_bytes(), data);
    }

    #[tokio::test]
    async fn test_pump_keeps_multibyte_char_split_across_reads() {
        let (mut writer, reader) = tokio::io::duplex(16);
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(pump(reader, tx));

        let bytes = "é".as_bytes();
        writer.write_all(&bytes[..1]).await.unwrap();
        writer.flush().await.unwrap();
        tokio::task::yield_now().await;
        writer.write_all(&bytes[1..]).await.unwrap();
        drop(writer);
        task.await.unwrap();

        let mut frames = Vec::new();
        while let Some(chunk) = rx.recv().await {
            frames.push(chunk);
        }
        assert_eq!(frames.concat(), "é");
        assert!(frames.iter().all(|f| !f.contains(char::REPLACEMENT_CHARACTER)));
    }

    #[test]
    fn test_take_utf8_holds_incomplete_tail() {
        let mut pending = b"ok \xe2\x82".to_vec();
        assert_eq!(take_utf8(&mut pending), "ok ");
        assert_eq!(pending, b"\xe2\x82");
        pending.push(0xac);
        assert_eq!(take_utf8(&mut pending), "€");
        assert!(pending.is_empty());
    }

    #[test]
    fn test_take_utf8_replaces_invalid_bytes() {
        let mut pending = b"a\xffb".to_vec();
        assert_eq!(take_utf8(&mut pending), "a\u{FFFD}b");
        assert!(pending.is_empty());
    }
}
