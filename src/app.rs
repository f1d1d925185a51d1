use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Result};
use crossbeam_channel::Receiver;

use crate::config;
use crate::data::{ListingService, RedditListingService};
use crate::outline::{self, OutlineOptions};
use crate::reddit::{self, StaticToken, TokenProvider};
use crate::session::{CommentTreeSession, ExpandOutcome, SessionEvent};
use crate::tree::Placeholder;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub target: String,
    pub expand_rounds: Option<usize>,
    pub width: Option<usize>,
    pub config_file: Option<PathBuf>,
}

pub fn run(opts: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: opts.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    if opts.config_file.is_none() {
        tracing::debug!(path = ?config::default_path(), "using default config location");
    }

    let post_id = reddit::parse_post_id(&opts.target)?;
    let token_provider = cfg
        .reddit
        .access_token
        .clone()
        .map(|token| Arc::new(StaticToken(token)) as Arc<dyn TokenProvider>);
    let client = Arc::new(
        reddit::Client::new(
            token_provider,
            reddit::ClientConfig {
                user_agent: cfg.reddit.user_agent.clone(),
                base_url: cfg.reddit.base_url.clone(),
                timeout: Some(cfg.reddit.timeout),
                http_client: None,
            },
        )
        .context("create reddit client")?,
    );
    let service: Arc<dyn ListingService> = Arc::new(RedditListingService::new(client.clone()));

    let mut session = CommentTreeSession::new(post_id, service);
    let events = session.events();
    let wait = cfg.session.wait_timeout;

    session.load()?;
    if !session.run_until_idle(wait) {
        bail!("timed out loading comments after {}", humantime::format_duration(wait));
    }
    for event in events.try_iter() {
        if let SessionEvent::TransportFailure { message, .. } = event {
            bail!("load comments: {message}");
        }
    }

    let rounds = opts.expand_rounds.unwrap_or(cfg.session.expand_rounds);
    for round in 0..rounds {
        let mut placeholders: Vec<_> =
            session.forest().placeholders().into_iter().cloned().collect();
        if placeholders.is_empty() {
            break;
        }
        let budget = client.rate_limit().budget(SystemTime::now());
        if !fit_to_budget(&mut placeholders, budget) {
            eprintln!("warning: reddit rate limit exhausted after {round} expansion rounds");
            break;
        }
        tracing::debug!(round, count = placeholders.len(), "expanding placeholders");
        for placeholder in &placeholders {
            if session.request_expansion(placeholder)? == ExpandOutcome::Stale {
                tracing::debug!(placeholder = %placeholder.id, "skipping stale placeholder");
            }
        }
        if !session.run_until_idle(wait) {
            eprintln!("warning: expansion round {} timed out", round + 1);
            break;
        }
        report_failures(&events);
    }

    let width = opts.width.unwrap_or(cfg.display.width);
    let lines = outline::render(
        session.forest(),
        &OutlineOptions {
            width,
            indent: cfg.display.indent,
        },
    );
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in lines {
        writeln!(out, "{line}")?;
    }
    out.flush()?;

    session.close();
    tracing::debug!(rate = ?client.rate_limit(), "done");
    Ok(())
}

/// Trims a round to the requests the rate window still allows. Returns false
/// when nothing may be sent.
fn fit_to_budget(placeholders: &mut Vec<Placeholder>, budget: Option<usize>) -> bool {
    let Some(budget) = budget else {
        return true;
    };
    if budget == 0 {
        return false;
    }
    if placeholders.len() > budget {
        tracing::debug!(
            budget,
            deferred = placeholders.len() - budget,
            "deferring placeholders to a later round"
        );
        placeholders.truncate(budget);
    }
    true
}

fn report_failures(events: &Receiver<SessionEvent>) {
    for event in events.try_iter() {
        match event {
            SessionEvent::TransportFailure {
                placeholder,
                message,
                ..
            } => {
                let which = placeholder.map(|id| id.to_string()).unwrap_or_default();
                eprintln!("warning: failed to expand {which}: {message}");
            }
            SessionEvent::AnchorNotFound {
                placeholder,
                anchor,
            } => {
                eprintln!("warning: {placeholder} lost its anchor {anchor}");
            }
            SessionEvent::Populated { .. } | SessionEvent::Expanded { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Anchor;

    fn round(n: usize) -> Vec<Placeholder> {
        (0..n)
            .map(|i| Placeholder::new(format!("m{i}"), Anchor::Root, 1))
            .collect()
    }

    #[test]
    fn unknown_budget_expands_everything() {
        let mut placeholders = round(5);
        assert!(fit_to_budget(&mut placeholders, None));
        assert_eq!(placeholders.len(), 5);
    }

    #[test]
    fn budget_defers_the_tail() {
        let mut placeholders = round(5);
        assert!(fit_to_budget(&mut placeholders, Some(2)));
        let ids: Vec<&str> = placeholders.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1"]);
    }

    #[test]
    fn exhausted_budget_stops_the_round() {
        let mut placeholders = round(3);
        assert!(!fit_to_budget(&mut placeholders, Some(0)));
    }
}
