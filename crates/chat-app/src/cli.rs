//! Command line front end: one question, one streamed answer.
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use lectern_llm::{HttpTransport, ResearchMode, TransportError};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::chat::{
    ChatUpdate, ControllerError, DiscussionId, StreamController, TokioFrameScheduler, TurnOutcome,
};
use crate::discussion::{
    DEFAULT_DISCUSSION_TITLE, Discussion, DiscussionError, DiscussionService, HttpDiscussions,
};
use crate::settings::{ClientSettings, SettingsStore};

#[derive(Parser, Debug, Clone)]
#[command(name = "lectern", version, about = "Ask the document assistant a question")]
pub struct Cli {
    /// Question to send.
    #[arg(required_unless_present = "list_providers")]
    pub question: Option<String>,

    /// Backend base URL.
    #[arg(long)]
    pub base_url: Option<String>,

    /// Model provider, e.g. `mistral` or `claude`.
    #[arg(long, short = 'p')]
    pub provider: Option<String>,

    /// One of `quick`, `enhanced` or `deep`.
    #[arg(long, short = 'm')]
    pub research_mode: Option<ResearchMode>,

    #[arg(long)]
    pub temperature: Option<f64>,

    #[arg(long)]
    pub max_tokens: Option<u64>,

    /// Continue this discussion instead of starting a new one.
    #[arg(long, value_name = "ID")]
    pub discussion: Option<DiscussionId>,

    /// Settings file to read instead of the per-user one.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Print the providers the backend offers and exit.
    #[arg(long, default_value_t = false)]
    pub list_providers: bool,
}

impl Cli {
    /// Flags win over the settings file.
    pub fn apply_to(&self, mut settings: ClientSettings) -> ClientSettings {
        if let Some(base_url) = &self.base_url {
            settings.base_url = base_url.clone();
        }
        if let Some(provider) = &self.provider {
            settings.provider = provider.clone();
        }
        if let Some(research_mode) = self.research_mode {
            settings.research_mode = research_mode;
        }
        if self.temperature.is_some() {
            settings.temperature = self.temperature;
        }
        if self.max_tokens.is_some() {
            settings.max_tokens = self.max_tokens;
        }
        settings.normalized()
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CliError {
    #[snafu(display("no question given on `{stage}`"))]
    MissingQuestion { stage: &'static str },
    #[snafu(display("transport failed on `{stage}`, {source}"))]
    Transport {
        stage: &'static str,
        source: TransportError,
    },
    #[snafu(display("discussion backend failed on `{stage}`, {source}"))]
    Discussion {
        stage: &'static str,
        source: DiscussionError,
    },
    #[snafu(display("turn failed on `{stage}`, {source}"))]
    Controller {
        stage: &'static str,
        source: ControllerError,
    },
}

pub type CliResult<T> = Result<T, CliError>;

/// Final state of one answered question.
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    pub outcome: TurnOutcome,
    pub html: String,
}

pub async fn run(cli: Cli) -> CliResult<ExitCode> {
    let store = match &cli.config {
        Some(path) => SettingsStore::new(path.clone()),
        None => SettingsStore::load(),
    };
    let settings = cli.apply_to((*store.settings()).clone());
    tracing::debug!(base_url = %settings.base_url, provider = %settings.provider, "resolved settings");

    if cli.list_providers {
        let transport = HttpTransport::new(settings.transport_config()).context(TransportSnafu {
            stage: "build-transport",
        })?;
        let providers = transport.list_providers().await.context(TransportSnafu {
            stage: "list-providers",
        })?;
        let mut stdout = std::io::stdout().lock();
        for provider in providers {
            let marker = if provider.configured { "" } else { " (not configured)" };
            let _ = writeln!(
                stdout,
                "{}\t{}\t{}{marker}",
                provider.name, provider.display_name, provider.model
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    let question = cli.question.clone().context(MissingQuestionSnafu {
        stage: "read-question",
    })?;
    let answer = ask(&settings, question, cli.discussion, std::io::stderr()).await?;
    println!("{}", answer.html);

    Ok(if answer.outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Runs one turn, writing streamed text to `progress` as it is flushed.
///
/// With `discussion` set the turn is appended to that discussion, which is
/// activated on the backend first.
pub async fn ask<W>(
    settings: &ClientSettings,
    question: String,
    discussion: Option<DiscussionId>,
    progress: W,
) -> CliResult<Answer>
where
    W: Write + Send + 'static,
{
    let transport = HttpTransport::new(settings.transport_config()).context(TransportSnafu {
        stage: "build-transport",
    })?;
    let discussions = HttpDiscussions::new(&settings.base_url).context(DiscussionSnafu {
        stage: "build-discussions",
    })?;
    if let Some(id) = discussion {
        discussions
            .navigate_to(id)
            .await
            .context(DiscussionSnafu {
                stage: "activate-existing-discussion",
            })?;
    }
    let (mut controller, updates) = StreamController::new(
        Arc::new(transport),
        Arc::new(discussions),
        Arc::new(TokioFrameScheduler::new(settings.flush_interval())),
        settings.turn_options(),
    );
    if let Some(id) = discussion {
        let existing = Discussion {
            id,
            title: DEFAULT_DISCUSSION_TITLE.to_string(),
        };
        controller = controller.with_discussion(existing, Vec::new());
    }

    let printer = tokio::spawn(print_progress(updates, progress));
    let handle = controller
        .send_message(question)
        .await
        .context(ControllerSnafu {
            stage: "send-message",
        })?;
    let outcome = controller.run_turn(&handle).await.context(ControllerSnafu {
        stage: "run-turn",
    })?;
    drop(controller);

    let html = printer.await.unwrap_or_else(|error| {
        tracing::warn!(error = %error, "progress printer failed");
        None
    });
    Ok(Answer {
        outcome,
        html: html.unwrap_or_default(),
    })
}

/// Echoes each newly flushed slice of text. Returns the final HTML.
async fn print_progress<W: Write>(
    mut updates: tokio::sync::mpsc::UnboundedReceiver<ChatUpdate>,
    mut progress: W,
) -> Option<String> {
    let mut printed = 0;
    let mut html = None;

    while let Some(update) = updates.recv().await {
        match update {
            ChatUpdate::ContentUpdated { content, .. } => {
                if let Some(delta) = content.get(printed..) {
                    let _ = write!(progress, "{delta}");
                    let _ = progress.flush();
                }
                printed = content.len();
            }
            ChatUpdate::TitleChanged { title, .. } => {
                tracing::debug!(title = %title, "discussion title");
            }
            ChatUpdate::MessageFinalized {
                html: rendered,
                message,
                ..
            } => {
                if let Some(delta) = message.content.get(printed..) {
                    let _ = writeln!(progress, "{delta}");
                }
                html = Some(rendered);
            }
            ChatUpdate::TurnStarted { .. }
            | ChatUpdate::SourcesUpdated { .. }
            | ChatUpdate::IntentUpdated { .. }
            | ChatUpdate::SuggestedQuestionsUpdated { .. } => {}
        }
    }
    html
}
