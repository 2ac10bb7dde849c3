use std::time::Duration;

use anyhow::{Context, Result};
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    select,
    time::timeout,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{info, warn};

use crate::cli::ConnectArgs;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketWriter = SplitSink<Socket, Message>;
type SocketReader = SplitStream<Socket>;

const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the client loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// `/quit`, end of input or Ctrl-C.
    Local,
    /// The server closed the socket or it failed.
    Remote,
}

pub async fn run(args: ConnectArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(&args).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let exit = run_client_loop(
        &mut reader,
        &mut writer,
        &mut stdin,
        &mut input,
        args.username.as_deref(),
    )
    .await?;
    if exit == Exit::Local {
        disconnect(&mut reader, &mut writer).await;
    }

    Ok(())
}

/// Prefixes `text` with the sender's name when one is configured.
pub fn compose_message(username: Option<&str>, text: &str) -> String {
    match username {
        Some(name) if !name.is_empty() => format!("[{name}] {text}"),
        _ => text.to_string(),
    }
}

async fn establish_connection(args: &ConnectArgs) -> Result<(SocketReader, SocketWriter)> {
    let url = format!("ws://{}/ws", args.addr);
    let (socket, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("failed to connect to {url}"))?;

    info!("connected to {url}");
    write_stdout(&format!("*** connected to {url}")).await?;

    let (writer, reader) = socket.split();
    Ok((reader, writer))
}

async fn run_client_loop(
    reader: &mut SocketReader,
    writer: &mut SocketWriter,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    username: Option<&str>,
) -> Result<Exit> {
    loop {
        input.clear();
        select! {
            frame = reader.next() => {
                if !handle_server_frame(frame).await? {
                    return Ok(Exit::Remote);
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, username, writer).await? {
                    return Ok(Exit::Local);
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                return Ok(Exit::Local);
            }
        }
    }
}

async fn handle_server_frame(
    frame: Option<Result<Message, tungstenite::Error>>,
) -> Result<bool> {
    match frame {
        Some(Ok(Message::Text(text))) => {
            write_stdout(&text).await?;
            Ok(true)
        }
        Some(Ok(Message::Binary(data))) => {
            write_stdout(&String::from_utf8_lossy(&data)).await?;
            Ok(true)
        }
        Some(Ok(Message::Close(_))) | None => {
            write_stdout("*** server closed the connection").await?;
            Ok(false)
        }
        Some(Ok(_)) => Ok(true),
        Some(Err(error)) => {
            warn!(?error, "read from server failed");
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    username: Option<&str>,
    writer: &mut SocketWriter,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    writer
        .send(Message::text(compose_message(username, text)))
        .await
        .context("failed to send message")?;
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

/// Sends a normal close frame and waits briefly for the server to answer.
async fn disconnect(reader: &mut SocketReader, writer: &mut SocketWriter) {
    let close = Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }));
    if let Err(error) = writer.send(close).await {
        warn!(?error, "failed to send close frame");
        return;
    }

    let drained = timeout(CLOSE_HANDSHAKE_TIMEOUT, async {
        while let Some(Ok(frame)) = reader.next().await {
            if frame.is_close() {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("server did not acknowledge close in time");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
