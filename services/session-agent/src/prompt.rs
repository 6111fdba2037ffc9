//! Terminal re-authentication prompt
//!
//! Asks for email and password on a line-oriented reader. An empty
//! password or end of input means the user declined.

use session_auth::LoginRequest;
use session_gate::ReauthPrompt;
use std::future::Future;
use std::pin::Pin;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, Lines};
use tokio::sync::Mutex;
use tracing::warn;

pub struct LinePrompt<R, W> {
    default_email: Option<String>,
    io: Mutex<(Lines<R>, W)>,
}

impl LinePrompt<tokio::io::BufReader<tokio::io::Stdin>, tokio::io::Stderr> {
    /// Prompt on stderr, read answers from stdin.
    pub fn terminal(default_email: Option<String>) -> Self {
        Self::new(
            tokio::io::BufReader::new(tokio::io::stdin()),
            tokio::io::stderr(),
            default_email,
        )
    }
}

impl<R, W> LinePrompt<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, default_email: Option<String>) -> Self {
        Self {
            default_email,
            io: Mutex::new((reader.lines(), writer)),
        }
    }

    async fn ask(&self, attempt: u32, pending: usize) -> std::io::Result<Option<LoginRequest>> {
        let mut io = self.io.lock().await;
        let (lines, out) = &mut *io;

        let header = if attempt == 1 {
            format!(
                "\nSession expired, {pending} request(s) waiting. \
                 Log in again (empty password to give up).\n"
            )
        } else {
            format!("\nLogin failed, try again ({pending} request(s) waiting).\n")
        };
        out.write_all(header.as_bytes()).await?;

        let label = match &self.default_email {
            Some(email) => format!("email [{email}]: "),
            None => "email: ".to_string(),
        };
        out.write_all(label.as_bytes()).await?;
        out.flush().await?;
        let Some(line) = lines.next_line().await? else {
            return Ok(None);
        };
        let email = match line.trim() {
            "" => match &self.default_email {
                Some(email) => email.clone(),
                None => return Ok(None),
            },
            typed => typed.to_string(),
        };

        out.write_all(b"password: ").await?;
        out.flush().await?;
        let Some(password) = lines.next_line().await? else {
            return Ok(None);
        };
        if password.is_empty() {
            return Ok(None);
        }
        Ok(Some(LoginRequest::new(email, password)))
    }
}

impl<R, W> ReauthPrompt for LinePrompt<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    fn prompt<'a>(
        &'a self,
        attempt: u32,
        pending: usize,
    ) -> Pin<Box<dyn Future<Output = Option<LoginRequest>> + Send + 'a>> {
        Box::pin(async move {
            match self.ask(attempt, pending).await {
                Ok(answer) => answer,
                Err(e) => {
                    warn!(error = %e, "could not read re-authentication answer");
                    None
                }
            }
        })
    }
}
