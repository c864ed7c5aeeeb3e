//! Terminal client: stdin lines go to the relay, relay payloads go to stdout.

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    framing::{Framing, PayloadReader},
};

const QUIT_COMMAND: &str = "/quit";
const LEAVING_NOTICE: &str = "*** leaving chat";
const CLOSED_NOTICE: &str = "*** server closed the connection";

/// What a line typed at the terminal asks the client to do.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Say(&'a str),
    Quit,
    Nothing,
}

impl<'a> Input<'a> {
    fn parse(line: &'a str) -> Self {
        let text = line.trim_end();
        if text.is_empty() {
            Input::Nothing
        } else if text.eq_ignore_ascii_case(QUIT_COMMAND) {
            Input::Quit
        } else {
            Input::Say(text)
        }
    }
}

/// One relay connection, framed the way the server was started.
struct Connection {
    payloads: PayloadReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    framing: Framing,
}

impl Connection {
    async fn open(args: &ClientArgs) -> Result<Self> {
        let stream = TcpStream::connect((args.host.as_str(), args.port))
            .await
            .with_context(|| format!("failed to connect to {}:{}", args.host, args.port))?;
        info!(host = %args.host, port = args.port, "connected to relay");

        let (reader, writer) = stream.into_split();
        Ok(Self {
            payloads: args.framing.reader(reader),
            writer,
            framing: args.framing,
        })
    }

    async fn say(&mut self, text: &str) -> io::Result<()> {
        self.writer.write_all(&self.framing.encode(text)).await?;
        self.writer.flush().await
    }

    async fn close(mut self) {
        if let Err(error) = self.writer.shutdown().await {
            warn!(?error, "failed to close relay connection cleanly");
        }
    }
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let mut connection = Connection::open(&args).await?;
    let mut stdout = tokio::io::stdout();

    // The nickname goes out alone and stdin stays unread until the welcome
    // arrives, so raw framing cannot merge it with a first message.
    connection
        .say(&args.nickname)
        .await
        .context("failed to send nickname")?;
    match connection.payloads.next_payload().await? {
        Some(welcome) => print_line(&mut stdout, &welcome).await?,
        None => {
            print_line(&mut stdout, CLOSED_NOTICE).await?;
            return Ok(());
        }
    }

    let mut terminal = BufReader::new(tokio::io::stdin()).lines();
    loop {
        select! {
            payload = connection.payloads.next_payload() => match payload? {
                Some(text) => print_line(&mut stdout, &text).await?,
                None => {
                    print_line(&mut stdout, CLOSED_NOTICE).await?;
                    break;
                }
            },
            line = terminal.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                match Input::parse(&line) {
                    Input::Say(text) => connection.say(text).await?,
                    Input::Quit => {
                        print_line(&mut stdout, LEAVING_NOTICE).await?;
                        break;
                    }
                    Input::Nothing => {}
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(error) = signal {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    connection.close().await;
    Ok(())
}

async fn print_line(stdout: &mut Stdout, line: &str) -> io::Result<()> {
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quit_is_case_insensitive() {
        assert_eq!(Input::parse("/quit\n"), Input::Quit);
        assert_eq!(Input::parse("/QUIT"), Input::Quit);
    }

    #[test]
    fn blank_lines_are_not_sent() {
        assert_eq!(Input::parse(""), Input::Nothing);
        assert_eq!(Input::parse("  \r"), Input::Nothing);
    }

    #[test]
    fn messages_keep_leading_whitespace() {
        assert_eq!(Input::parse("  hi there \r"), Input::Say("  hi there"));
        assert_eq!(Input::parse("/quitting"), Input::Say("/quitting"));
    }
}
