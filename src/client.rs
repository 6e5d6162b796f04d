//! Interactive client for the relay.
//!
//! Two loops share one connection: the input loop forwards each non-empty
//! line verbatim, and the receive loop prints whatever the relay sends. The
//! client is done when the relay closes the connection, which it does after
//! the client sends the quit sentinel.
//!
//! Console lines are read on a plain thread and handed over a channel, so a
//! pending console read never keeps the runtime alive after the relay is gone.

use crate::session::is_quit;
use bytes::BytesMut;
use std::io::{self, BufRead};
use std::thread;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Receive buffer size, matching the relay's read size
const BUFFER_SIZE: usize = 1024;

/// Lines buffered between the console thread and the input loop
const INPUT_QUEUE: usize = 64;

/// Start a thread that forwards lines from `source` until it ends.
///
/// The thread is detached; it stops at end of input, on a read error, or
/// once the receiving side is dropped and the next line is read.
pub fn spawn_line_reader<B>(source: B) -> io::Result<mpsc::Receiver<String>>
where
    B: BufRead + Send + 'static,
{
    let (tx, rx) = mpsc::channel(INPUT_QUEUE);

    thread::Builder::new()
        .name("console-input".to_string())
        .spawn(move || {
            for line in source.lines() {
                match line {
                    Ok(line) => {
                        if tx.blocking_send(line).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Console read failed");
                        break;
                    }
                }
            }
        })?;

    Ok(rx)
}

/// Run the client over `stream` until the relay closes it.
///
/// Returns once the receive loop ends. A failing input loop is logged and
/// does not end the session on its own.
pub async fn run<S, O>(stream: S, input: mpsc::Receiver<String>, output: O) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    O: AsyncWrite + Unpin,
{
    let (reader, writer) = tokio::io::split(stream);

    let input_task = tokio::spawn(async move {
        if let Err(e) = input_loop(input, writer).await {
            warn!(error = %e, "Input loop failed, messages are no longer sent");
        }
    });
    let received = receive_loop(reader, output).await;

    // The relay is gone; nothing left to send to.
    input_task.abort();
    received
}

/// Forward lines from `input` until the quit sentinel or end of input.
///
/// Lines are sent without their terminator. End of input shuts down the
/// write half so the relay sees the client leave.
pub async fn input_loop<W>(mut input: mpsc::Receiver<String>, mut writer: W) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = input.recv().await {
        let message = line.trim_end_matches(['\r', '\n']);
        if message.is_empty() {
            continue;
        }

        writer.write_all(message.as_bytes()).await?;
        writer.flush().await?;
        trace!(bytes = message.len(), "Sent message");

        if is_quit(message) {
            debug!("Quit sent");
            return Ok(());
        }
    }

    debug!("Input closed");
    writer.shutdown().await
}

/// Print every chunk the relay sends as one line on `output`.
pub async fn receive_loop<R, O>(mut reader: R, mut output: O) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        let n = reader.read_buf(&mut buffer).await?;
        if n == 0 {
            debug!("Relay closed connection");
            return Ok(());
        }

        let message = String::from_utf8_lossy(&buffer[..n]);
        output.write_all(message.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
        buffer.clear();
    }
}
