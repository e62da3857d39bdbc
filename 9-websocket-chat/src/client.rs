use std::time::Duration;

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    select,
    time::timeout,
};
use tracing::warn;

pub use crate::endpoint::DEFAULT_NAME;
use crate::{
    cli::ClientArgs,
    endpoint::{ChatEndpoint, ChatEvent, CloseKind, ConnectionState, EventStream},
};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn run(args: ClientArgs) -> Result<()> {
    // One line reader for the whole session; a partial line survives a
    // `select!` branch losing the race to an incoming event.
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let name = match args.name.as_deref() {
        Some(name) => resolve_display_name(Some(name)),
        None => prompt_for_name(&mut stdin).await?,
    };

    let (mut endpoint, mut events) = ChatEndpoint::new(name);
    endpoint
        .connect(&args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;

    run_client_loop(&endpoint, &mut events, &mut stdin).await?;
    shutdown_session(&endpoint, &mut events).await;

    Ok(())
}

/// Falls back to [`DEFAULT_NAME`] for missing or blank input.
pub fn resolve_display_name(entered: Option<&str>) -> String {
    match entered {
        Some(name) if !name.trim().is_empty() => name.to_string(),
        _ => DEFAULT_NAME.to_string(),
    }
}

async fn prompt_for_name<R>(stdin: &mut Lines<R>) -> Result<String>
where
    R: AsyncBufRead + Unpin,
{
    write_stdout("Please enter your name:").await?;
    let line = stdin.next_line().await.context("failed to read name")?;
    Ok(resolve_display_name(line.as_deref()))
}

async fn run_client_loop<R>(
    endpoint: &ChatEndpoint,
    events: &mut EventStream,
    stdin: &mut Lines<R>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        select! {
            event = events.recv() => {
                if !handle_event(event, endpoint.display_name()).await? {
                    break;
                }
            }
            line = stdin.next_line() => {
                if !handle_stdin_input(line, endpoint).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_event(event: Option<ChatEvent>, name: &str) -> Result<bool> {
    let Some(event) = event else {
        return Ok(false);
    };
    let keep_going = !matches!(event, ChatEvent::Closed { .. });
    render_event(event, name).await?;
    Ok(keep_going)
}

async fn handle_stdin_input(
    line: io::Result<Option<String>>,
    endpoint: &ChatEndpoint,
) -> Result<bool> {
    let Some(text) = line? else {
        return Ok(false);
    };

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    endpoint.send(&text);
    Ok(true)
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

/// Closes normally and waits briefly for the peer to acknowledge.
async fn shutdown_session(endpoint: &ChatEndpoint, events: &mut EventStream) {
    if endpoint.state() != ConnectionState::Open {
        return;
    }
    endpoint.close();

    let drained = timeout(CLOSE_TIMEOUT, async {
        while let Some(event) = events.recv().await {
            if matches!(event, ChatEvent::Closed { .. }) {
                break;
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("peer did not acknowledge close");
    }
}

async fn render_event(event: ChatEvent, name: &str) -> io::Result<()> {
    match event {
        ChatEvent::Opened => write_stdout(&format!("*** connected as {name}")).await,
        ChatEvent::Presence(users) => write_stdout(&format!("*** Online Users: {users}")).await,
        ChatEvent::Message(text) => write_stdout(&text).await,
        ChatEvent::Error(error) => write_stderr(&format!("!!! {error}")).await,
        ChatEvent::Closed {
            kind: CloseKind::Normal,
            ..
        } => write_stdout("*** connection closed").await,
        ChatEvent::Closed { code, .. } => {
            write_stderr(&format!("!!! connection closed with code {code}")).await
        }
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}

#[cfg(test)]
mod tests {
    use futures_util::{SinkExt, StreamExt};
    use tokio::{net::TcpListener, sync::oneshot, time::sleep};
    use tokio_tungstenite::{accept_async, tungstenite::Message};

    use super::*;

    #[test]
    fn blank_names_fall_back_to_default() {
        assert_eq!(resolve_display_name(None), "Anonymous");
        assert_eq!(resolve_display_name(Some("")), "Anonymous");
        assert_eq!(resolve_display_name(Some("   ")), "Anonymous");
    }

    #[test]
    fn entered_names_are_kept_verbatim() {
        assert_eq!(resolve_display_name(Some("Alice")), "Alice");
        assert_eq!(resolve_display_name(Some(" Bob ")), " Bob ");
    }

    #[tokio::test]
    async fn closed_event_ends_the_loop() {
        let closed = ChatEvent::Closed {
            code: 1000,
            kind: CloseKind::Normal,
        };
        assert!(!handle_event(Some(closed), "alice").await.expect("render"));
        assert!(!handle_event(None, "alice").await.expect("render"));
    }

    #[tokio::test]
    async fn partial_line_survives_incoming_event() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}/ws", listener.local_addr()?);
        let (push_tx, push_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await?;
            let mut socket = accept_async(stream).await?;
            let mut received = Vec::new();
            if let Some(Ok(Message::Text(name))) = socket.next().await {
                received.push(name.as_str().to_string());
            }
            let _ = push_rx.await;
            socket
                .send(Message::Text("Online Users: alice".to_string().into()))
                .await?;
            while let Some(Ok(Message::Text(text))) = socket.next().await {
                received.push(text.as_str().to_string());
            }
            anyhow::Ok(received)
        });

        let (mut endpoint, mut events) = ChatEndpoint::new("alice");
        endpoint.connect(&url).await?;

        let (mut typist, reader) = tokio::io::duplex(64);
        let mut lines = BufReader::new(reader).lines();
        let typing = async move {
            typist.write_all(b"hel").await?;
            sleep(Duration::from_millis(50)).await;
            let _ = push_tx.send(());
            sleep(Duration::from_millis(100)).await;
            typist.write_all(b"lo\n/quit\n").await?;
            Ok::<_, io::Error>(typist)
        };

        let (looped, typed) = tokio::join!(
            run_client_loop(&endpoint, &mut events, &mut lines),
            typing
        );
        looped?;
        let _typist = typed?;
        shutdown_session(&endpoint, &mut events).await;

        let received = timeout(CLOSE_TIMEOUT, server).await???;
        assert_eq!(received, vec!["alice", "hello"]);
        Ok(())
    }
}
