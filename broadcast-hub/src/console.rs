use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    select,
};
use tracing::warn;

use crate::{
    cli::ConnectArgs,
    client::{Client, Incoming},
    envelope::Envelope,
};

/// Runs the `connect` command: stdin lines go out as envelopes of
/// `args.kind`, every received envelope is printed as one JSON line.
pub async fn run(args: ConnectArgs) -> Result<()> {
    let mut client = Client::connect(args.server)
        .await
        .with_context(|| format!("failed to connect to {}", args.server))?;
    let mut incoming = client.receive()?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    run_console_loop(&mut client, &mut incoming, &mut stdin, &mut input, &args.kind).await?;
    if let Err(error) = client.close().await {
        warn!(%error, "failed to close connection cleanly");
    }

    Ok(())
}

async fn run_console_loop(
    client: &mut Client,
    incoming: &mut Incoming,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
    kind: &str,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            envelope = incoming.recv() => {
                if !handle_incoming(envelope).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, client, kind).await? {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(%error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

async fn handle_incoming(envelope: Option<Envelope>) -> Result<bool> {
    match envelope {
        Some(envelope) => {
            let line = serde_json::to_string(&envelope)?;
            emit(tokio::io::stdout(), &line).await?;
            Ok(true)
        }
        None => {
            emit(tokio::io::stderr(), "*** server closed the connection").await?;
            Ok(false)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    client: &mut Client,
    kind: &str,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        emit(tokio::io::stderr(), "*** leaving").await?;
        return Ok(false);
    }

    client.send(&Envelope::new(kind, text)).await?;
    Ok(true)
}

/// Writes `line` and its newline in a single write.
async fn emit<W>(mut out: W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    out.write_all(format!("{line}\n").as_bytes()).await?;
    out.flush().await
}
