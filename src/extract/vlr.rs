//! Rule set for vlr.gg
//!
//! Covers the match listing, match detail, team and player pages. One match
//! page yields its two teams, every listed player, the match, each map
//! played and one stat line per player per map.

use super::{
    first_text, full_text, id_after, non_empty, normalize_img_url, parse_float, parse_int,
    select_text, selector, ExtractionRule, RuleRegistry,
};
use crate::error::ExtractError;
use crate::models::{CandidateRecord, EntityKind, MatchStatus, RawPage, TargetKind};
use chrono::{NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use scraper::{ElementRef, Html};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

pub const VLR_SOURCE: &str = "vlr";

/// Register every vlr.gg rule
pub fn register_vlr_rules(registry: &mut RuleRegistry) {
    registry.register(Arc::new(VlrMatchListRule));
    registry.register(Arc::new(VlrMatchRule));
    registry.register(Arc::new(VlrTeamRule));
    registry.register(Arc::new(VlrPlayerRule));
}

fn mismatch(rule: &dyn ExtractionRule, anchor: &str) -> ExtractError {
    ExtractError::SchemaMismatch {
        rule: rule.label(),
        anchor: anchor.to_string(),
    }
}

fn base_url(page_url: &str) -> String {
    match url::Url::parse(page_url) {
        Ok(u) => format!("{}://{}", u.scheme(), u.host_str().unwrap_or("www.vlr.gg")),
        Err(_) => "https://www.vlr.gg".to_string(),
    }
}

// ===== Match listing =====

/// `/matches` and `/matches/results`
pub struct VlrMatchListRule;

impl ExtractionRule for VlrMatchListRule {
    fn source(&self) -> &str {
        VLR_SOURCE
    }

    fn kind(&self) -> TargetKind {
        TargetKind::MatchList
    }

    fn version(&self) -> u32 {
        1
    }

    fn wait_selector(&self) -> Option<&'static str> {
        Some("a.match-item")
    }

    fn extract(&self, page: &RawPage) -> Result<Vec<CandidateRecord>, ExtractError> {
        let document = Html::parse_document(&page.html);
        let root = document.root_element();
        let item_sel = selector("a.match-item")?;
        let link_sel = selector("a[href]")?;
        let status_sel = selector(".ml-status")?;
        let event_sel = selector(".match-item-event")?;
        let series_sel = selector(".match-item-event-series")?;
        let base = base_url(&page.url);

        let mut items: Vec<ElementRef> = root.select(&item_sel).collect();
        if items.is_empty() {
            // Fall back to any link shaped like a match page
            let match_href = Regex::new(r"^/\d+/.+").map_err(|e| ExtractError::Selector(e.to_string()))?;
            items = root
                .select(&link_sel)
                .filter(|a| {
                    a.value()
                        .attr("href")
                        .map(|h| match_href.is_match(h))
                        .unwrap_or(false)
                })
                .collect();
        }
        if items.is_empty() {
            return Err(mismatch(self, "a.match-item"));
        }

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for item in items {
            let Some(href) = item.value().attr("href") else {
                continue;
            };
            let Some(match_ref) = id_after(href, "/") else {
                continue;
            };
            if !seen.insert(match_ref.clone()) {
                continue;
            }

            let status = MatchStatus::from_page_text(&select_text(&item, &status_sel));
            let series = non_empty(select_text(&item, &series_sel));
            // The event cell holds the series line followed by the event name
            let event = item.select(&event_sel).next().and_then(|e| {
                let all = full_text(&e);
                let name = match &series {
                    Some(s) => all.replacen(s.as_str(), "", 1),
                    None => all,
                };
                non_empty(name.trim().to_string())
            });

            let record = CandidateRecord::new(EntityKind::Match, match_ref, page.provenance())
                .with_field("status", status.map(|s| s.to_string()))
                .with_field("event_name", event)
                .with_field("series_name", series)
                .with_field("url", Some(format!("{}{}", base, href)));
            records.push(record);
        }

        Ok(records)
    }
}

// ===== Match detail =====

/// `/{match_id}/{slug}`
pub struct VlrMatchRule;

struct HeaderTeam {
    external_ref: String,
    name: Option<String>,
    logo_url: Option<String>,
}

impl ExtractionRule for VlrMatchRule {
    fn source(&self) -> &str {
        VLR_SOURCE
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Match
    }

    fn version(&self) -> u32 {
        1
    }

    fn wait_selector(&self) -> Option<&'static str> {
        Some("div.match-header")
    }

    fn extract(&self, page: &RawPage) -> Result<Vec<CandidateRecord>, ExtractError> {
        let document = Html::parse_document(&page.html);
        let root = document.root_element();

        let match_ref = id_after(&page.url, "/").ok_or_else(|| mismatch(self, "match id in url"))?;

        let header_sel = selector("div.match-header")?;
        let header = root
            .select(&header_sel)
            .next()
            .ok_or_else(|| mismatch(self, "div.match-header"))?;

        let prov = page.provenance();
        let mut records = Vec::new();

        // Event and schedule
        let event_name = non_empty(select_text(
            &header,
            &selector("div.match-header-super a.match-header-event div > div:first-child")?,
        ));
        let series_name = non_empty(select_text(
            &header,
            &selector("div.match-header-event-series")?,
        ));
        let scheduled_at = header
            .select(&selector("div.match-header-date .moment-tz-convert[data-utc-ts]")?)
            .next()
            .and_then(|e| e.value().attr("data-utc-ts"))
            .and_then(|ts| NaiveDateTime::parse_from_str(ts.trim(), "%Y-%m-%d %H:%M:%S").ok())
            .map(|dt| Utc.from_utc_datetime(&dt).to_rfc3339());
        let patch = header
            .select(&selector("div.match-header-date > div")?)
            .map(|e| first_text(&e))
            .find(|t| t.starts_with("Patch"))
            .map(|t| t.trim_start_matches("Patch").trim().to_string())
            .and_then(non_empty);

        let vs_notes: Vec<String> = header
            .select(&selector("div.match-header-vs-note")?)
            .map(|e| first_text(&e))
            .collect();
        let status = vs_notes
            .first()
            .and_then(|s| MatchStatus::from_page_text(s))
            .unwrap_or(MatchStatus::Upcoming);

        // Teams
        let team_link_sel = selector("div.match-header-vs a.match-header-link")?;
        let name_sel = selector("div.wf-title-med")?;
        let img_sel = selector("img")?;
        let teams: Vec<HeaderTeam> = header
            .select(&team_link_sel)
            .filter_map(|link| {
                let external_ref = link.value().attr("href").and_then(|h| id_after(h, "/team/"))?;
                Some(HeaderTeam {
                    external_ref,
                    name: non_empty(select_text(&link, &name_sel)),
                    logo_url: link
                        .select(&img_sel)
                        .next()
                        .and_then(|i| i.value().attr("src"))
                        .map(normalize_img_url),
                })
            })
            .collect();

        if teams.len() != 2 && status != MatchStatus::Upcoming {
            return Err(mismatch(self, "div.match-header-vs a.match-header-link"));
        }
        let teams = if teams.len() == 2 { teams } else { Vec::new() };

        let scores: Vec<i64> = header
            .select(&selector("div.match-header-vs-score span:not(.match-header-vs-score-colon)")?)
            .filter_map(|e| parse_int(&first_text(&e)))
            .collect();
        let (team1_score, team2_score) = match (status, scores.as_slice()) {
            (MatchStatus::Upcoming, _) => (None, None),
            (_, [a, b]) => (Some(*a), Some(*b)),
            _ => (None, None),
        };

        for team in &teams {
            records.push(
                CandidateRecord::new(EntityKind::Team, team.external_ref.clone(), prov.clone())
                    .with_field("name", team.name.clone())
                    .with_field("logo_url", team.logo_url.clone()),
            );
        }

        let mut match_record = CandidateRecord::new(EntityKind::Match, match_ref.clone(), prov.clone())
            .with_field("status", Some(status.to_string()))
            .with_field("event_name", event_name)
            .with_field("series_name", series_name)
            .with_field("scheduled_at", scheduled_at)
            .with_field("patch", patch)
            .with_field("team1_score", team1_score)
            .with_field("team2_score", team2_score)
            .with_field("url", Some(page.url.clone()));
        if let [t1, t2] = teams.as_slice() {
            match_record = match_record
                .with_ref("team1_id", EntityKind::Team, t1.external_ref.clone())
                .with_ref("team2_id", EntityKind::Team, t2.external_ref.clone());
        }

        if status == MatchStatus::Upcoming {
            records.push(match_record);
            return Ok(records);
        }

        // Maps and player stats
        let stats_sel = selector("div.vm-stats")?;
        let stats = root
            .select(&stats_sel)
            .next()
            .ok_or_else(|| mismatch(self, "div.vm-stats"))?;
        records.push(match_record);

        let game_sel = selector("div.vm-stats-game:not([data-game-id='all'])")?;
        let mut seen_players = HashSet::new();
        let mut games = 0;
        for (index, game) in stats.select(&game_sel).enumerate() {
            let Some(game_id) = game.value().attr("data-game-id") else {
                continue;
            };
            let game_ref = format!("{}/{}", match_ref, game_id);
            records.extend(self.extract_game(&game, index, &game_ref, &match_ref, &teams, page, &mut seen_players)?);
            games += 1;
        }
        if games == 0 {
            return Err(mismatch(self, "div.vm-stats-game"));
        }

        Ok(records)
    }
}

impl VlrMatchRule {
    #[allow(clippy::too_many_arguments)]
    fn extract_game(
        &self,
        game: &ElementRef,
        index: usize,
        game_ref: &str,
        match_ref: &str,
        teams: &[HeaderTeam],
        page: &RawPage,
        seen_players: &mut HashSet<String>,
    ) -> Result<Vec<CandidateRecord>, ExtractError> {
        let prov = page.provenance();
        let mut records = Vec::new();

        let map_name = non_empty(select_text(
            game,
            &selector("div.vm-stats-game-header div.map div:first-child span")?,
        ))
        .map(|m| m.replace("PICK", "").trim().to_string());
        let duration = non_empty(select_text(
            game,
            &selector("div.vm-stats-game-header div.map-duration")?,
        ));
        let picked_by = game
            .select(&selector("div.vm-stats-game-header div.map span.picked")?)
            .next()
            .and_then(|e| {
                if e.value().classes().any(|c| c == "mod-1") {
                    teams.first()
                } else if e.value().classes().any(|c| c == "mod-2") {
                    teams.get(1)
                } else {
                    None
                }
            });
        let scores: Vec<Option<i64>> = game
            .select(&selector("div.vm-stats-game-header div.team div.score")?)
            .map(|e| parse_int(&first_text(&e)))
            .collect();

        let mut game_record = CandidateRecord::new(EntityKind::Game, game_ref, prov.clone())
            .with_field("ordinal", Some(index as i64 + 1))
            .with_field("map_name", map_name)
            .with_field("duration", duration)
            .with_field("team1_score", scores.first().copied().flatten())
            .with_field("team2_score", scores.get(1).copied().flatten())
            .with_ref("match_id", EntityKind::Match, match_ref);
        if let Some(team) = picked_by {
            game_record = game_record.with_ref("picked_by", EntityKind::Team, team.external_ref.clone());
        }
        records.push(game_record);

        // One table per team, in header order
        let table_sel = selector("table")?;
        let row_sel = selector("tbody tr")?;
        let player_cell_sel = selector("td.mod-player")?;
        let tables: Vec<ElementRef> = game
            .select(&table_sel)
            .filter(|t| t.select(&player_cell_sel).next().is_some())
            .collect();
        if tables.len() < teams.len() {
            return Err(mismatch(self, "table td.mod-player"));
        }

        for (table, team) in tables.iter().zip(teams.iter()) {
            for row in table.select(&row_sel) {
                if row.select(&player_cell_sel).next().is_none() {
                    continue;
                }
                let (player, line) = self.extract_player_row(&row, game_ref, team, page)?;
                if let Some(player) = player {
                    if seen_players.insert(player.external_ref.clone()) {
                        records.push(player);
                    }
                }
                if let Some(line) = line {
                    records.push(line);
                }
            }
        }

        Ok(records)
    }

    fn extract_player_row(
        &self,
        row: &ElementRef,
        game_ref: &str,
        team: &HeaderTeam,
        page: &RawPage,
    ) -> Result<(Option<CandidateRecord>, Option<CandidateRecord>), ExtractError> {
        let prov = page.provenance();
        let player_cell = row
            .select(&selector("td.mod-player")?)
            .next()
            .ok_or_else(|| mismatch(self, "td.mod-player"))?;

        let Some(player_ref) = player_cell
            .select(&selector("a")?)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|h| id_after(h, "/player/"))
        else {
            return Ok((None, None));
        };

        let name = non_empty(select_text(&player_cell, &selector("a div:first-child")?));
        let nation = player_cell
            .select(&selector("i.flag")?)
            .next()
            .and_then(|e| e.value().attr("title"))
            .map(|t| t.trim().to_string())
            .and_then(non_empty);
        let agent = row
            .select(&selector("td.mod-agents img")?)
            .next()
            .and_then(|e| e.value().attr("title").or_else(|| e.value().attr("alt")))
            .map(str::to_string);

        let both_sel = selector("span.side.mod-both")?;
        let cells: Vec<String> = row
            .select(&selector("td.mod-stat")?)
            .map(|cell| {
                let both = select_text(&cell, &both_sel);
                if both.is_empty() {
                    first_text(&cell)
                } else {
                    both
                }
            })
            .collect();
        let int = |i: usize| cells.get(i).and_then(|s| parse_int(s));
        let float = |i: usize| cells.get(i).and_then(|s| parse_float(s));

        let player = CandidateRecord::new(EntityKind::Player, player_ref.clone(), prov.clone())
            .with_field("name", name)
            .with_field("nation", nation)
            .with_ref("team_id", EntityKind::Team, team.external_ref.clone());

        let line = CandidateRecord::new(
            EntityKind::StatLine,
            format!("{}/{}", game_ref, player_ref),
            prov,
        )
        .with_field("agent", agent)
        .with_field("rating", float(0))
        .with_field("acs", float(1))
        .with_field("kills", int(2))
        .with_field("deaths", int(3))
        .with_field("assists", int(4))
        .with_field("kd_diff", int(5))
        .with_field("kast", float(6))
        .with_field("adr", float(7))
        .with_field("hs_pct", float(8))
        .with_field("first_kills", int(9))
        .with_field("first_deaths", int(10))
        .with_field("fk_diff", int(11))
        .with_ref("game_id", EntityKind::Game, game_ref)
        .with_ref("player_id", EntityKind::Player, player_ref)
        .with_ref("team_id", EntityKind::Team, team.external_ref.clone());

        Ok((Some(player), Some(line)))
    }
}

// ===== Team page =====

/// `/team/{id}/{slug}`
pub struct VlrTeamRule;

impl ExtractionRule for VlrTeamRule {
    fn source(&self) -> &str {
        VLR_SOURCE
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Team
    }

    fn version(&self) -> u32 {
        1
    }

    fn wait_selector(&self) -> Option<&'static str> {
        Some("div.team-header")
    }

    fn extract(&self, page: &RawPage) -> Result<Vec<CandidateRecord>, ExtractError> {
        let document = Html::parse_document(&page.html);
        let root = document.root_element();
        let team_ref = id_after(&page.url, "/team/").ok_or_else(|| mismatch(self, "team id in url"))?;

        let header = root
            .select(&selector("div.team-header")?)
            .next()
            .ok_or_else(|| mismatch(self, "div.team-header"))?;
        let name = non_empty(select_text(&header, &selector("h1.wf-title")?))
            .ok_or_else(|| mismatch(self, "div.team-header h1.wf-title"))?;

        let prov = page.provenance();
        let team = CandidateRecord::new(EntityKind::Team, team_ref.clone(), prov.clone())
            .with_field("name", Some(name))
            .with_field("tag", non_empty(select_text(&header, &selector("h2.team-header-tag")?)))
            .with_field(
                "region",
                non_empty(select_text(&header, &selector("div.team-header-country")?)),
            )
            .with_field(
                "logo_url",
                header
                    .select(&selector("div.team-header-logo img")?)
                    .next()
                    .and_then(|i| i.value().attr("src"))
                    .map(normalize_img_url),
            );

        let mut records = vec![team];
        let item_sel = selector("div.team-roster-item")?;
        let link_sel = selector("a[href]")?;
        let alias_sel = selector("div.team-roster-item-name-alias")?;
        let real_sel = selector("div.team-roster-item-name-real")?;
        let role_sel = selector("div.team-roster-item-name-role")?;
        let flag_sel = selector("i.flag")?;

        for item in root.select(&item_sel) {
            let role = select_text(&item, &role_sel).to_lowercase();
            if ["coach", "manager", "analyst", "staff", "performance"]
                .iter()
                .any(|r| role.contains(r))
            {
                continue;
            }
            let Some(player_ref) = item
                .select(&link_sel)
                .next()
                .and_then(|a| a.value().attr("href"))
                .and_then(|h| id_after(h, "/player/"))
            else {
                continue;
            };
            let nation = item
                .select(&flag_sel)
                .next()
                .and_then(|f| f.value().attr("title"))
                .map(str::to_string);

            records.push(
                CandidateRecord::new(EntityKind::Player, player_ref, prov.clone())
                    .with_field("name", non_empty(select_text(&item, &alias_sel)))
                    .with_field("real_name", non_empty(select_text(&item, &real_sel)))
                    .with_field("nation", nation)
                    .with_ref("team_id", EntityKind::Team, team_ref.clone()),
            );
        }

        Ok(records)
    }
}

// ===== Player page =====

/// `/player/{id}/{slug}`
pub struct VlrPlayerRule;

impl ExtractionRule for VlrPlayerRule {
    fn source(&self) -> &str {
        VLR_SOURCE
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Player
    }

    fn version(&self) -> u32 {
        1
    }

    fn wait_selector(&self) -> Option<&'static str> {
        Some("div.player-header")
    }

    fn extract(&self, page: &RawPage) -> Result<Vec<CandidateRecord>, ExtractError> {
        let document = Html::parse_document(&page.html);
        let root = document.root_element();
        let player_ref =
            id_after(&page.url, "/player/").ok_or_else(|| mismatch(self, "player id in url"))?;

        let header = root
            .select(&selector("div.player-header")?)
            .next()
            .ok_or_else(|| mismatch(self, "div.player-header"))?;
        let name = non_empty(select_text(&header, &selector("h1.wf-title")?))
            .ok_or_else(|| mismatch(self, "div.player-header h1.wf-title"))?;
        let real_name = non_empty(select_text(&header, &selector("h2.player-real-name")?));
        let nation = header
            .select(&selector("div.ge-text-light")?)
            .map(|e| full_text(&e))
            .find(|t| !t.is_empty() && !t.starts_with('@'));

        // First team link on the page is the current team
        let current_team = root
            .select(&selector("a.wf-module-item[href^='/team/']")?)
            .next()
            .and_then(|a| a.value().attr("href"))
            .and_then(|h| id_after(h, "/team/"));

        let mut record = CandidateRecord::new(EntityKind::Player, player_ref, page.provenance())
            .with_field("name", Some(name))
            .with_field("real_name", real_name)
            .with_field("nation", nation.map(Value::String));
        if let Some(team_ref) = current_team {
            record = record.with_ref("team_id", EntityKind::Team, team_ref);
        }

        Ok(vec![record])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;

    const MATCH_LIST: &str = include_str!("fixtures/vlr_matches.html");
    const MATCH_COMPLETED: &str = include_str!("fixtures/vlr_match_completed.html");
    const MATCH_UPCOMING: &str = include_str!("fixtures/vlr_match_upcoming.html");
    const TEAM: &str = include_str!("fixtures/vlr_team.html");
    const PLAYER: &str = include_str!("fixtures/vlr_player.html");

    fn page(url: &str, html: &str) -> RawPage {
        RawPage {
            source: VLR_SOURCE.to_string(),
            url: url.to_string(),
            html: html.to_string(),
            fetched_at: Utc::now(),
            snapshot_id: Some("snap-1".to_string()),
        }
    }

    fn of_kind(records: &[CandidateRecord], kind: EntityKind) -> Vec<&CandidateRecord> {
        records.iter().filter(|r| r.kind == kind).collect()
    }

    #[test]
    fn test_match_list() {
        let records = VlrMatchListRule
            .extract(&page("https://www.vlr.gg/matches", MATCH_LIST))
            .unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.kind == EntityKind::Match));

        let live = &records[0];
        assert_eq!(live.external_ref, "353177");
        assert_eq!(live.field_str("status"), Some("live"));
        assert_eq!(live.field_str("series_name"), Some("Playoffs: Upper Final"));
        assert_eq!(live.field_str("event_name"), Some("Champions Tour 2024: Masters Shanghai"));
        assert_eq!(
            live.field_str("url"),
            Some("https://www.vlr.gg/353177/gen-g-vs-sentinels-masters-shanghai-ubf")
        );
        assert_eq!(records[1].field_str("status"), Some("upcoming"));
        assert_eq!(records[2].field_str("status"), Some("completed"));
        assert_eq!(live.provenance.snapshot_id.as_deref(), Some("snap-1"));
    }

    #[test]
    fn test_match_list_falls_back_to_numeric_links() {
        let html = r#"<html><body>
            <a href="/100/a-vs-b">A vs B</a>
            <a href="/100/a-vs-b/?game=1">dup</a>
            <a href="/team/2/sentinels">not a match</a>
            <a href="/101/c-vs-d">C vs D</a>
        </body></html>"#;
        let records = VlrMatchListRule
            .extract(&page("https://www.vlr.gg/matches", html))
            .unwrap();
        let refs: Vec<&str> = records.iter().map(|r| r.external_ref.as_str()).collect();
        assert_eq!(refs, vec!["100", "101"]);
    }

    #[test]
    fn test_match_list_without_matches_is_mismatch() {
        let err = VlrMatchListRule
            .extract(&page("https://www.vlr.gg/matches", "<html><body>maintenance</body></html>"))
            .unwrap_err();
        assert!(matches!(err, ExtractError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_completed_match_yields_full_graph() {
        let records = VlrMatchRule
            .extract(&page(
                "https://www.vlr.gg/353177/gen-g-vs-sentinels-masters-shanghai-ubf",
                MATCH_COMPLETED,
            ))
            .unwrap();

        let teams = of_kind(&records, EntityKind::Team);
        assert_eq!(teams.len(), 2);
        assert_eq!(teams[0].external_ref, "17");
        assert_eq!(teams[0].field_str("name"), Some("Gen.G"));
        assert_eq!(
            teams[0].field_str("logo_url"),
            Some("https://owcdn.net/img/genG.png")
        );

        let matches = of_kind(&records, EntityKind::Match);
        assert_eq!(matches.len(), 1);
        let m = matches[0];
        assert_eq!(m.external_ref, "353177");
        assert_eq!(m.field_str("status"), Some("completed"));
        assert_eq!(m.field_str("event_name"), Some("Champions Tour 2024: Masters Shanghai"));
        assert_eq!(m.field_str("series_name"), Some("Playoffs: Upper Final"));
        assert_eq!(m.field_str("scheduled_at"), Some("2024-05-25T06:00:00+00:00"));
        assert_eq!(m.field_str("patch"), Some("8.09"));
        assert_eq!(m.fields.get("team1_score"), Some(&Value::from(2)));
        assert_eq!(m.fields.get("team2_score"), Some(&Value::from(1)));
        assert_eq!(m.refs["team1_id"].external_ref, "17");
        assert_eq!(m.refs["team2_id"].external_ref, "2");

        let games = of_kind(&records, EntityKind::Game);
        assert_eq!(games.len(), 2);
        assert_eq!(games[0].external_ref, "353177/170001");
        assert_eq!(games[0].field_str("map_name"), Some("Bind"));
        assert_eq!(games[0].field_str("duration"), Some("42:17"));
        assert_eq!(games[0].fields.get("ordinal"), Some(&Value::from(1)));
        assert_eq!(games[0].fields.get("team1_score"), Some(&Value::from(13)));
        assert_eq!(games[0].refs["picked_by"].external_ref, "17");
        assert_eq!(games[0].refs["match_id"].external_ref, "353177");
        assert_eq!(games[1].refs["picked_by"].external_ref, "2");

        // Two players, each appearing in both maps, deduplicated
        let players = of_kind(&records, EntityKind::Player);
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].field_str("name"), Some("t3xture"));
        assert_eq!(players[0].field_str("nation"), Some("South Korea"));
        assert_eq!(players[0].refs["team_id"].external_ref, "17");
        assert_eq!(players[1].refs["team_id"].external_ref, "2");

        let lines = of_kind(&records, EntityKind::StatLine);
        assert_eq!(lines.len(), 4);
        let first = lines[0];
        assert_eq!(first.external_ref, "353177/170001/3520");
        assert_eq!(first.field_str("agent"), Some("Raze"));
        assert_eq!(first.fields.get("rating"), Some(&Value::from(1.32)));
        assert_eq!(first.fields.get("acs"), Some(&Value::from(281.0)));
        assert_eq!(first.fields.get("kills"), Some(&Value::from(24)));
        assert_eq!(first.fields.get("kd_diff"), Some(&Value::from(8)));
        assert_eq!(first.fields.get("kast"), Some(&Value::from(76.0)));
        assert_eq!(first.fields.get("fk_diff"), Some(&Value::from(-1)));
        assert_eq!(first.refs["game_id"].external_ref, "353177/170001");
        assert_eq!(first.refs["player_id"].external_ref, "3520");
    }

    #[test]
    fn test_upcoming_match_needs_no_stats() {
        let records = VlrMatchRule
            .extract(&page("https://www.vlr.gg/400001/loud-vs-fnatic", MATCH_UPCOMING))
            .unwrap();
        let matches = of_kind(&records, EntityKind::Match);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].field_str("status"), Some("upcoming"));
        assert!(!matches[0].fields.contains_key("team1_score"));
        assert_eq!(of_kind(&records, EntityKind::Team).len(), 2);
        assert!(of_kind(&records, EntityKind::Game).is_empty());
    }

    #[test]
    fn test_completed_match_without_stats_is_mismatch() {
        let html = MATCH_COMPLETED.replace("vm-stats", "vm-statz");
        let err = VlrMatchRule
            .extract(&page("https://www.vlr.gg/353177/x", &html))
            .unwrap_err();
        match err {
            ExtractError::SchemaMismatch { rule, anchor } => {
                assert_eq!(rule, "vlr/match@1");
                assert_eq!(anchor, "div.vm-stats");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_completed_match_without_games_is_mismatch() {
        let html = MATCH_COMPLETED.replace(
            "class=\"vm-stats-game\" data-game-id=\"17",
            "class=\"vm-stats-round\" data-game-id=\"17",
        );
        let err = VlrMatchRule
            .extract(&page("https://www.vlr.gg/353177/x", &html))
            .unwrap_err();
        match err {
            ExtractError::SchemaMismatch { anchor, .. } => {
                assert_eq!(anchor, "div.vm-stats-game");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_game_without_stat_tables_is_mismatch() {
        let html = MATCH_COMPLETED
            .replace("<table", "<section")
            .replace("</table>", "</section>");
        let err = VlrMatchRule
            .extract(&page("https://www.vlr.gg/353177/x", &html))
            .unwrap_err();
        match err {
            ExtractError::SchemaMismatch { rule, anchor } => {
                assert_eq!(rule, "vlr/match@1");
                assert_eq!(anchor, "table td.mod-player");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_missing_header_is_mismatch() {
        let err = VlrMatchRule
            .extract(&page("https://www.vlr.gg/1/x", "<html><body></body></html>"))
            .unwrap_err();
        assert!(matches!(err, ExtractError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_team_page() {
        let records = VlrTeamRule
            .extract(&page("https://www.vlr.gg/team/2/sentinels", TEAM))
            .unwrap();
        let team = &records[0];
        assert_eq!(team.kind, EntityKind::Team);
        assert_eq!(team.external_ref, "2");
        assert_eq!(team.field_str("name"), Some("Sentinels"));
        assert_eq!(team.field_str("tag"), Some("SEN"));
        assert_eq!(team.field_str("region"), Some("United States"));

        // Coach is skipped
        let players = of_kind(&records, EntityKind::Player);
        assert_eq!(players.len(), 2);
        assert_eq!(players[0].field_str("name"), Some("zekken"));
        assert_eq!(players[0].field_str("real_name"), Some("Zachary Patrone"));
        assert_eq!(players[0].refs["team_id"].external_ref, "2");
    }

    #[test]
    fn test_player_page() {
        let records = VlrPlayerRule
            .extract(&page("https://www.vlr.gg/player/4004/zekken", PLAYER))
            .unwrap();
        assert_eq!(records.len(), 1);
        let p = &records[0];
        assert_eq!(p.external_ref, "4004");
        assert_eq!(p.field_str("name"), Some("zekken"));
        assert_eq!(p.field_str("real_name"), Some("Zachary Patrone"));
        assert_eq!(p.field_str("nation"), Some("United States"));
        assert_eq!(p.refs["team_id"].external_ref, "2");
    }

    #[test]
    fn test_registry_routes_builtin_rules() {
        let registry = RuleRegistry::with_builtin_rules();
        assert!(registry.supports(VLR_SOURCE, TargetKind::Player));
        assert_eq!(
            registry.wait_policy(VLR_SOURCE, TargetKind::Match).selector.as_deref(),
            Some("div.match-header")
        );
        let extraction = registry
            .extract(&page("https://www.vlr.gg/team/2/sentinels", TEAM), TargetKind::Team)
            .unwrap();
        assert_eq!(extraction.rule, "vlr/team@1");
    }
}
