use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow, ensure};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    process::{Child, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let binary = assert_cmd::cargo::cargo_bin!("chat-relay");
    let relay = Relay::start(&binary).await?;

    let mut alice = Participant::join(&binary, relay.port, "alice").await?;
    let mut bob = Participant::join(&binary, relay.port, "bob").await?;
    alice.expect_broadcast("bob joined the chat").await?;

    alice.say("Hello from Alice").await?;
    bob.expect_broadcast("alice: Hello from Alice").await?;

    // Bob's next line must be Alice leaving, not an echo of his reply.
    bob.say("Hi Alice!").await?;
    alice.expect_broadcast("bob: Hi Alice!").await?;

    alice.quit().await?;
    bob.expect_broadcast("alice left the chat").await?;
    bob.quit().await?;

    relay.stop().await;
    Ok(())
}

/// A `chat-relay server` process on an ephemeral port.
struct Relay {
    child: Child,
    port: u16,
    logs: JoinHandle<()>,
}

impl Relay {
    async fn start(binary: &Path) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["server", "--port", "0", "--framing", "line"])
            .env("RUST_LOG", "info")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn relay")?;
        let stdout = child.stdout.take().context("relay stdout not piped")?;
        let mut logs = BufReader::new(stdout).lines();

        let banner = next_line(&mut logs)
            .await?
            .context("relay exited before listening")?;
        let port = listening_port(&banner)?;

        // Keep consuming logs so the pipe never fills.
        let logs = tokio::spawn(async move { while let Ok(Some(_)) = logs.next_line().await {} });

        Ok(Self { child, port, logs })
    }

    async fn stop(mut self) {
        let _ = self.child.kill().await;
        let _ = self.logs.await;
    }
}

/// Pulls the port out of the `listening on <addr>` log line.
fn listening_port(banner: &str) -> Result<u16> {
    let (_, addr) = banner
        .split_once("listening on ")
        .ok_or_else(|| anyhow!("unexpected relay banner: {banner}"))?;
    let (_, port) = addr
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("relay banner missing port: {banner}"))?;
    port.parse().with_context(|| format!("bad port in banner: {banner}"))
}

/// A `chat-relay client` process driven through its stdin and stdout.
struct Participant {
    nickname: String,
    child: Child,
    stdin: ChildStdin,
    output: Lines<BufReader<ChildStdout>>,
}

impl Participant {
    /// Starts a client and waits for its private welcome.
    async fn join(binary: &Path, port: u16, nickname: &str) -> Result<Self> {
        let mut child = Command::new(binary)
            .args(["client", "--nickname", nickname, "--framing", "line"])
            .args(["--port", &port.to_string()])
            .env("RUST_LOG", "warn")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn client {nickname}"))?;
        let stdin = child.stdin.take().context("client stdin not piped")?;
        let stdout = child.stdout.take().context("client stdout not piped")?;

        let mut participant = Self {
            nickname: nickname.to_string(),
            child,
            stdin,
            output: BufReader::new(stdout).lines(),
        };
        let welcome = participant.expect_line().await?;
        ensure!(
            welcome == format!("Welcome to the chat, {nickname}!"),
            "{nickname} got '{welcome}' instead of a welcome"
        );
        Ok(participant)
    }

    async fn say(&mut self, text: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{text}\n").as_bytes())
            .await
            .with_context(|| format!("{} failed to type '{text}'", self.nickname))?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn expect_line(&mut self) -> Result<String> {
        next_line(&mut self.output)
            .await
            .with_context(|| format!("reading {}'s terminal", self.nickname))?
            .ok_or_else(|| anyhow!("{}'s client exited early", self.nickname))
    }

    /// Expects a timestamped relay line carrying `body`.
    async fn expect_broadcast(&mut self, body: &str) -> Result<()> {
        let line = self.expect_line().await?;
        let (stamp, rest) = line
            .split_once("] ")
            .ok_or_else(|| anyhow!("{} got an unstamped line: '{line}'", self.nickname))?;
        ensure!(
            stamp.starts_with('[') && stamp.len() == "[HH:MM:SS".len(),
            "malformed timestamp in '{line}'"
        );
        ensure!(rest == body, "{} expected '{body}', got '{rest}'", self.nickname);
        Ok(())
    }

    /// Types `/quit` and waits for the client to confirm and exit cleanly.
    async fn quit(mut self) -> Result<()> {
        self.say("/quit").await?;
        let farewell = self.expect_line().await?;
        ensure!(farewell == "*** leaving chat", "unexpected farewell '{farewell}'");

        let status = timeout(READ_TIMEOUT, self.child.wait())
            .await
            .map_err(|_| anyhow!("{} did not exit after /quit", self.nickname))??;
        ensure!(status.success(), "{} exited with {status}", self.nickname);
        Ok(())
    }
}

async fn next_line(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<Option<String>> {
    let line = timeout(READ_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| anyhow!("timed out waiting for output"))??;
    Ok(line.map(|line| line.trim_end_matches('\r').to_string()))
}
