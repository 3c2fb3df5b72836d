//! Session naming.
//!
//! Town roles live under `hq-`, everything team-scoped under `gt-{team}-`.
//! The same names are used as tmux session names, so the grammar is also how
//! sessions started by someone else are recognised.

use super::types::AgentRole;
use crate::{GasTownError, Result};

/// Identity recovered from a session id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSessionId {
    pub role: AgentRole,
    pub team: Option<String>,
    pub worker: Option<String>,
}

fn required<'a>(value: Option<&'a str>, field: &str, role: AgentRole) -> Result<&'a str> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(GasTownError::InvalidRequest(format!(
            "{} is required for role {}",
            field, role
        ))),
    }
}

/// Compute the session id for a role and identity.
pub fn generate_session_id(
    role: AgentRole,
    team: Option<&str>,
    worker: Option<&str>,
) -> Result<String> {
    let id = match role {
        AgentRole::Mayor | AgentRole::Deacon => format!("hq-{}", role),
        AgentRole::Witness | AgentRole::Refinery => {
            format!("gt-{}-{}", required(team, "team", role)?, role)
        }
        AgentRole::Polecat => format!(
            "gt-{}-{}",
            required(team, "team", role)?,
            required(worker, "worker", role)?
        ),
        AgentRole::Crew => format!(
            "gt-{}-crew-{}",
            required(team, "team", role)?,
            required(worker, "worker", role)?
        ),
    };
    Ok(id)
}

/// Recover role and identity from a session id. `None` outside the grammar.
pub fn parse_session_id(id: &str) -> Option<ParsedSessionId> {
    if let Some(role) = id.strip_prefix("hq-") {
        let role: AgentRole = role.parse().ok()?;
        if !role.is_town() {
            return None;
        }
        return Some(ParsedSessionId {
            role,
            team: None,
            worker: None,
        });
    }

    let rest = id.strip_prefix("gt-")?;
    let (team, tail) = rest.split_once('-')?;
    if team.is_empty() || tail.is_empty() {
        return None;
    }

    let parsed = if let Some(worker) = tail.strip_prefix("crew-") {
        if worker.is_empty() {
            return None;
        }
        ParsedSessionId {
            role: AgentRole::Crew,
            team: Some(team.to_string()),
            worker: Some(worker.to_string()),
        }
    } else if tail == "witness" || tail == "refinery" {
        ParsedSessionId {
            role: tail.parse().ok()?,
            team: Some(team.to_string()),
            worker: None,
        }
    } else {
        ParsedSessionId {
            role: AgentRole::Polecat,
            team: Some(team.to_string()),
            worker: Some(tail.to_string()),
        }
    };
    Some(parsed)
}
