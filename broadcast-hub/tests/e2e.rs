use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, bail};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const LINE_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_relay_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("broadcast-hub");

    let mut server = Command::new(&binary)
        .args(["serve", "--listen", "127.0.0.1:0"])
        .env("RUST_LOG", "info")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("failed to spawn server")?;
    let mut logs = BufReader::new(server.stderr.take().context("server stderr missing")?).lines();

    // Banner ends with the bound address, e.g. "... INFO server listening on 127.0.0.1:40123".
    let banner = timeout(LINE_TIMEOUT, logs.next_line())
        .await??
        .context("server exited before printing its address")?;
    let addr = banner
        .rsplit(' ')
        .next()
        .filter(|token| token.contains(':'))
        .with_context(|| format!("no socket address in banner: {banner}"))?
        .to_string();

    let mut logs = logs.into_inner();
    let log_sink = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut logs, &mut tokio::io::sink()).await;
    });

    let mut alice = Console::spawn(&binary, &addr)?;
    alice.expect(r#"{"type":"joined","payload":{"client":0}}"#).await?;

    let mut bob = Console::spawn(&binary, &addr)?;
    bob.expect(r#"{"type":"joined","payload":{"client":1}}"#).await?;
    alice.expect(r#"{"type":"joined","payload":{"client":1}}"#).await?;

    alice.say("hello").await?;
    let relayed = r#"{"type":"chat","payload":{"from":0,"payload":"hello"}}"#;
    bob.expect(relayed).await?;
    alice.expect(relayed).await?;

    alice.say("/quit").await?;
    alice.finish().await?;
    bob.expect(r#"{"type":"left","payload":{"client":0}}"#).await?;

    bob.say("/quit").await?;
    bob.finish().await?;

    server.kill().await?;
    log_sink.await?;
    Ok(())
}

/// A `connect` subprocess: stdin lines go out, stdout lines are envelopes.
struct Console {
    child: Child,
    input: ChildStdin,
    output: Lines<BufReader<ChildStdout>>,
}

impl Console {
    fn spawn(binary: &Path, addr: &str) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["connect", "--server", addr])
            .env("RUST_LOG", "off")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn console client")?;

        let input = child.stdin.take().context("console stdin missing")?;
        let output = child.stdout.take().context("console stdout missing")?;
        Ok(Self {
            child,
            input,
            output: BufReader::new(output).lines(),
        })
    }

    async fn say(&mut self, text: &str) -> Result<()> {
        self.input.write_all(format!("{text}\n").as_bytes()).await?;
        self.input.flush().await?;
        Ok(())
    }

    async fn expect(&mut self, wanted: &str) -> Result<()> {
        let line = timeout(LINE_TIMEOUT, self.output.next_line())
            .await
            .with_context(|| format!("timed out waiting for {wanted}"))??
            .with_context(|| format!("console exited while waiting for {wanted}"))?;
        assert_eq!(line, wanted);
        Ok(())
    }

    async fn finish(mut self) -> Result<()> {
        let status = timeout(LINE_TIMEOUT, self.child.wait()).await??;
        if !status.success() {
            bail!("console exited with {status}");
        }
        Ok(())
    }
}
