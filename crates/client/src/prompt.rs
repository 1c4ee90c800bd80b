use std::path::PathBuf;

use async_trait::async_trait;
use dialoguer::{Confirm, Input, Password, theme::ColorfulTheme};
use git::{RemoteCredentials, ResultCode};
use indicatif::ProgressBar;
use services::services::remote_operation::{
    CredentialPrompter, CredentialRequest, CredentialResponse,
};
use tracing::{debug, warn};
use utils::text::truncate_to_char_boundary;

const MAX_DETAIL_LEN: usize = 300;

/// Asks for credentials on the terminal. An empty username, Esc or Ctrl-C
/// cancels the operation.
pub struct TerminalPrompter {
    offer_remember: bool,
    bar: Option<ProgressBar>,
}

impl TerminalPrompter {
    pub fn new(offer_remember: bool, bar: Option<ProgressBar>) -> Self {
        Self {
            offer_remember,
            bar,
        }
    }
}

#[async_trait]
impl CredentialPrompter for TerminalPrompter {
    async fn prompt(&self, request: CredentialRequest) -> CredentialResponse {
        let offer_remember = self.offer_remember;
        let bar = self.bar.clone();
        let asked = tokio::task::spawn_blocking(move || match bar {
            Some(bar) => bar.suspend(|| ask(&request, offer_remember)),
            None => ask(&request, offer_remember),
        })
        .await;

        match asked {
            Ok(Ok(Some(credentials))) => CredentialResponse::Provided(credentials),
            Ok(Ok(None)) => CredentialResponse::Cancelled,
            Ok(Err(e)) => {
                debug!("Credential prompt aborted: {}", e);
                CredentialResponse::Cancelled
            }
            Err(e) => {
                warn!("Credential prompt failed: {}", e);
                CredentialResponse::Cancelled
            }
        }
    }
}

fn ask(
    request: &CredentialRequest,
    offer_remember: bool,
) -> Result<Option<RemoteCredentials>, dialoguer::Error> {
    let theme = ColorfulTheme::default();
    let previous = &request.previous;

    eprintln!();
    eprintln!("{}: {}", previous.remote_url, request.header);
    if request.message != request.header {
        eprintln!(
            "  {}",
            truncate_to_char_boundary(request.message.trim(), MAX_DETAIL_LEN)
        );
    }

    let mut username: Input<String> = Input::with_theme(&theme)
        .with_prompt("Username (empty to cancel)")
        .allow_empty(true);
    if let Some(ref saved) = previous.username {
        username = username.default(saved.clone());
    }
    let username = username.interact_text()?;
    if username.trim().is_empty() {
        return Ok(None);
    }

    let mut answer = previous.clone();
    answer.username = Some(username.trim().to_string());

    if request.code == ResultCode::VcsAuthRequired {
        let mut key: Input<String> = Input::with_theme(&theme)
            .with_prompt("Private key (empty to use the SSH agent)")
            .allow_empty(true);
        if let Some(ref saved) = previous.key_path {
            key = key.default(saved.display().to_string());
        }
        let key = key.interact_text()?;
        answer.key_path = (!key.trim().is_empty()).then(|| PathBuf::from(key.trim()));
    }

    let secret_prompt = if answer.key_path.is_some() {
        "Key passphrase"
    } else {
        "Password or token"
    };
    let secret = Password::with_theme(&theme)
        .with_prompt(secret_prompt)
        .allow_empty_password(true)
        .interact()?;
    answer.secret = (!secret.is_empty()).then_some(secret);

    answer.remember = offer_remember
        && Confirm::with_theme(&theme)
            .with_prompt("Remember these credentials?")
            .default(false)
            .interact()?;

    Ok(Some(answer))
}
