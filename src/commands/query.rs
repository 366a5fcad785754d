//! Read commands: matches and player stat lines

use crate::error::{Error, Result};
use crate::models::MatchStatus;
use crate::store::{MatchQuery, MatchRow, StatLineRow, StatQuery, Store};
use chrono::{DateTime, NaiveDate, Utc};
use tracing::debug;

/// Parse a `YYYY-MM-DD` or RFC 3339 bound
pub fn parse_date(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
        .ok_or_else(|| Error::Other(format!("Invalid date '{}': expected YYYY-MM-DD", s)))
}

pub fn parse_status(s: &str) -> Result<MatchStatus> {
    match s.to_lowercase().as_str() {
        "upcoming" => Ok(MatchStatus::Upcoming),
        "live" => Ok(MatchStatus::Live),
        "completed" => Ok(MatchStatus::Completed),
        other => Err(Error::Other(format!(
            "Invalid status '{}': expected upcoming, live or completed",
            other
        ))),
    }
}

pub async fn cmd_matches(store: &Store, query: &MatchQuery) -> Result<Vec<MatchRow>> {
    debug!("Querying matches: {:?}", query);
    store.matches_in_range(query).await
}

pub async fn cmd_stats(store: &Store, query: &StatQuery) -> Result<Vec<StatLineRow>> {
    debug!("Querying stat lines: {:?}", query);
    store.stat_lines(query).await
}

fn opt<T: std::fmt::Display>(v: &Option<T>) -> String {
    v.as_ref().map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Print matches to console
pub fn print_matches(matches: &[MatchRow]) {
    if matches.is_empty() {
        println!("No matches found.");
        return;
    }

    for m in matches {
        println!(
            "{} {} {} – {} {} [{}]",
            m.scheduled_at.as_deref().unwrap_or("unscheduled"),
            m.team1_name.as_deref().unwrap_or("TBD"),
            opt(&m.team1_score),
            opt(&m.team2_score),
            m.team2_name.as_deref().unwrap_or("TBD"),
            opt(&m.status),
        );
        let event = [m.event_name.as_deref(), m.series_name.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" · ");
        if !event.is_empty() {
            println!("  {}", event);
        }
        println!("  ID: {} (v{})", m.id, m.version);
    }
}

/// Print stat lines to console
pub fn print_stat_lines(lines: &[StatLineRow]) {
    if lines.is_empty() {
        println!("No stat lines found.");
        return;
    }

    println!(
        "{:<16} {:<16} {:<10} {:<10} {:>6} {:>5} {:>9} {:>6}",
        "Player", "Team", "Map", "Agent", "Rating", "ACS", "K/D/A", "ADR"
    );
    for s in lines {
        println!(
            "{:<16} {:<16} {:<10} {:<10} {:>6} {:>5} {:>9} {:>6}",
            s.player_name.as_deref().unwrap_or("?"),
            s.team_name.as_deref().unwrap_or("?"),
            s.map_name.as_deref().unwrap_or("?"),
            s.agent.as_deref().unwrap_or("?"),
            opt(&s.rating),
            opt(&s.acs),
            format!("{}/{}/{}", opt(&s.kills), opt(&s.deaths), opt(&s.assists)),
            opt(&s.adr),
        );
    }
}
