//! Health and load poller.
//!
//! A long-lived task that keeps one replica cluster-wide polling every known
//! server: it fans out `getMeetings`, recomputes the load estimate, drives
//! the per-server health state machine and reconciles meeting liveness.
//! Exclusivity is enforced by the `poller` database lease; the holder
//! re-confirms it on every pass and between fan-out waits.

use crate::bbb::{xml, BbbClient, BbbResponse, Params};
use crate::config::Config;
use crate::models::ServerHealth;
use crate::repositories::{CallbacksRepository, Lease, MeetingsRepository, ServersRepository};
use rand::Rng;
use sqlx::PgPool;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Concurrent `pollOne` fan-out bound.
const POLL_CONCURRENCY: usize = 8;

/// Callbacks older than this never fire; their meetings are long gone.
const CALLBACK_MAX_AGE_DAYS: i64 = 45;

/// Meetings without an internal ID older than this never materialized.
const UNCONFIRMED_MAX_AGE_MINUTES: i64 = 5;

/// Run the poller until cancelled.
///
/// The outer loop competes for the lease with a random sub-second jitter so
/// replicas take turns fairly; the inner loop runs while the lease holds.
#[instrument(skip_all, name = "lb.task.poller")]
pub async fn run_poller(
    pool: PgPool,
    http: reqwest::Client,
    config: Config,
    cancel: CancellationToken,
) {
    let interval = config.poll_interval_duration();
    let lease = Lease::new(pool.clone(), "poller", interval * 2);

    info!(
        target: "lb.task.poller",
        interval_secs = config.poll_interval,
        "Starting poller task"
    );

    loop {
        // Random sleep so other replicas get a chance at the lease.
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
        tokio::select! {
            () = tokio::time::sleep(jitter) => {}
            () = cancel.cancelled() => break,
        }

        match lease.try_acquire().await {
            Ok(true) => {
                poll_loop(&pool, &http, &config, &lease, &cancel).await;
                if let Err(e) = lease.try_release().await {
                    warn!(target: "lb.task.poller", error = %e, "Failed to release poller lease");
                }
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(
                    target: "lb.task.poller",
                    error = %e,
                    "Failed to acquire poller lease"
                );
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = cancel.cancelled() => break,
                }
            }
        }

        if cancel.is_cancelled() {
            break;
        }
    }

    info!(target: "lb.task.poller", "Poller task stopped");
}

/// The inner loop: runs while we hold the lease.
async fn poll_loop(
    pool: &PgPool,
    http: &reqwest::Client,
    config: &Config,
    lease: &Lease,
    cancel: &CancellationToken,
) {
    info!(target: "lb.task.poller", "Starting poller loop");
    let interval = config.poll_interval_duration();

    loop {
        let ts_start = Instant::now();

        match lease.check().await {
            Ok(true) => {}
            Ok(false) => {
                warn!(target: "lb.task.poller", "Lost the poller lease");
                return;
            }
            Err(e) => {
                warn!(target: "lb.task.poller", error = %e, "Lease check failed");
                return;
            }
        }

        housekeeping(pool).await;

        let servers = match ServersRepository::list_all(pool).await {
            Ok(servers) => servers,
            Err(e) => {
                tracing::error!(target: "lb.task.poller", error = %e, "Failed to list servers");
                return;
            }
        };

        let semaphore = Arc::new(Semaphore::new(POLL_CONCURRENCY));
        let mut tasks = JoinSet::new();
        for server in servers {
            let pool = pool.clone();
            let http = http.clone();
            let config = config.clone();
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                poll_one(&pool, &http, &config, server.id).await;
            });
        }

        // Wait for the fan-out, re-confirming the lease whenever the wait
        // stretches. A lost lease cancels all outstanding polls.
        let wait_budget = lease.timeout.mul_f64(0.8);
        loop {
            match tokio::time::timeout(wait_budget, tasks.join_next()).await {
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(_) => {
                    if !lease.check().await.unwrap_or(false) {
                        warn!(target: "lb.task.poller", "Lost the poller lease mid fan-out");
                        tasks.abort_all();
                        return;
                    }
                }
            }
        }

        let elapsed = ts_start.elapsed();
        if elapsed > interval {
            warn!(
                target: "lb.task.poller",
                elapsed_secs = elapsed.as_secs_f64(),
                interval_secs = config.poll_interval,
                "Poll took longer than the interval"
            );
        }
        let sleep = interval.saturating_sub(elapsed).max(Duration::from_secs(1));
        tokio::select! {
            () = tokio::time::sleep(sleep) => {}
            () = cancel.cancelled() => return,
        }
    }
}

/// Opportunistic cleanup, done once per pass by the lease holder.
async fn housekeeping(pool: &PgPool) {
    match CallbacksRepository::delete_older_than(pool, chrono::Duration::days(CALLBACK_MAX_AGE_DAYS))
        .await
    {
        Ok(count) if count > 0 => {
            info!(target: "lb.task.poller", count = count, "Purged expired callbacks");
        }
        Ok(_) => {}
        Err(e) => warn!(target: "lb.task.poller", error = %e, "Callback cleanup failed"),
    }

    match MeetingsRepository::delete_stale_unconfirmed(
        pool,
        chrono::Duration::minutes(UNCONFIRMED_MAX_AGE_MINUTES),
    )
    .await
    {
        Ok(count) if count > 0 => {
            info!(
                target: "lb.task.poller",
                count = count,
                "Purged meetings whose backend create never succeeded"
            );
        }
        Ok(_) => {}
        Err(e) => warn!(target: "lb.task.poller", error = %e, "Stale meeting cleanup failed"),
    }
}

/// Accumulated results of parsing one server's getMeetings answer.
#[derive(Debug, Default)]
struct PollStats {
    live_internal_ids: HashSet<String>,
    users: i64,
    load: f64,
}

/// Load contribution of one running meeting.
///
/// Young meetings carry an anticipation penalty that decays linearly over
/// the cooldown window; their participant counts have not caught up yet.
fn meeting_load(fragment: &str, config: &Config, now_ms: i64) -> f64 {
    let text_num = |path: &[&str]| -> f64 {
        xml::find_text(fragment, path)
            .and_then(|v| v.trim().parse::<f64>().ok())
            .unwrap_or(0.0)
    };

    let mut load = config.load_base;
    load += text_num(&["participantCount"]) * config.load_user;
    load += text_num(&["voiceParticipantCount"]) * config.load_voice;
    load += text_num(&["videoCount"]) * config.load_video;

    let create_time = xml::find_text(fragment, &["createTime"])
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(0);
    let age_secs = ((now_ms - create_time).max(0) as f64) / 1000.0;
    let cooldown = config.load_cooldown_secs();
    if age_secs < cooldown {
        load += config.load_penalty * (1.0 - age_secs / cooldown);
    }

    load
}

/// Parse a getMeetings response into poll statistics.
fn collect_stats(
    response: &BbbResponse,
    known_internal_ids: &HashMap<String, i64>,
    config: &Config,
    now_ms: i64,
    domain: &str,
) -> PollStats {
    let mut stats = PollStats::default();

    let fragments = xml::extract_elements(&response.body, "meeting").unwrap_or_default();
    for fragment in fragments {
        let end_time = xml::find_text(&fragment, &["endTime"])
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0);
        if end_time > 0 {
            continue;
        }

        let Some(internal_id) = xml::find_text(&fragment, &["internalMeetingID"]) else {
            continue;
        };
        stats.live_internal_ids.insert(internal_id.clone());

        stats.users += xml::find_text(&fragment, &["participantCount"])
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0);
        stats.load += meeting_load(&fragment, config, now_ms);

        if !known_internal_ids.contains_key(&internal_id) {
            let parent = xml::find_text(&fragment, &["breakout", "parentMeetingID"]);
            if parent.is_some_and(|p| !p.is_empty()) {
                // Breakout rooms are created behind our back; not ours to track.
                continue;
            }
            warn!(
                target: "lb.task.poller",
                server = %domain,
                internal_id = %internal_id,
                "Meeting on server that is not in the database"
            );
        }
    }

    stats
}

/// Poll one server and persist the outcome.
#[instrument(skip_all, name = "lb.task.poll_one", fields(server_id = server_id))]
async fn poll_one(pool: &PgPool, http: &reqwest::Client, config: &Config, server_id: i64) {
    let server = match ServersRepository::get(pool, server_id).await {
        Ok(Some(server)) => server,
        Ok(None) => return,
        Err(e) => {
            warn!(target: "lb.task.poller", error = %e, "Failed to read server");
            return;
        }
    };
    let meetings = match MeetingsRepository::for_server(pool, server_id).await {
        Ok(meetings) => meetings,
        Err(e) => {
            warn!(target: "lb.task.poller", error = %e, "Failed to read meetings");
            return;
        }
    };

    if !server.enabled && meetings.is_empty() {
        return;
    }

    let known: HashMap<String, i64> = meetings
        .iter()
        .filter_map(|m| m.internal_id.clone().map(|id| (id, m.id)))
        .collect();

    info!(
        target: "lb.task.poller",
        server = %server.domain,
        health = server.health.as_db_str(),
        "Polling server"
    );

    let client = BbbClient::new(
        http.clone(),
        server.api_base(),
        server.secret.clone(),
        Some(Duration::from_secs(config.request_timeout)),
    );
    let now_ms = chrono::Utc::now().timestamp_millis();
    let poll_result = client
        .action("getMeetings", &Params::new())
        .await
        .and_then(BbbResponse::raise_on_error);

    let stats = match &poll_result {
        Ok(response) => Some(collect_stats(response, &known, config, now_ms, &server.domain)),
        Err(e) => {
            warn!(
                target: "lb.task.poller",
                server = %server.domain,
                error = %e,
                "Server returned an error"
            );
            None
        }
    };

    if let Err(e) = persist_poll_outcome(pool, config, server_id, stats).await {
        warn!(
            target: "lb.task.poller",
            server = %server.domain,
            error = %e,
            "Failed to persist poll outcome"
        );
    }
}

/// Write the poll outcome in one transaction: meeting reconciliation, load,
/// health counters, zombie cleanup.
async fn persist_poll_outcome(
    pool: &PgPool,
    config: &Config,
    server_id: i64,
    stats: Option<PollStats>,
) -> Result<(), crate::errors::LbError> {
    let mut tx = pool.begin().await?;

    if let Some(stats) = &stats {
        let live: Vec<String> = stats.live_internal_ids.iter().cloned().collect();
        let forgotten = MeetingsRepository::delete_missing(&mut tx, server_id, &live).await?;
        if forgotten > 0 {
            tracing::debug!(
                target: "lb.task.poller",
                count = forgotten,
                "Forgot meetings no longer on their server"
            );
        }
    }

    // Re-read inside the transaction so counter updates do not clobber
    // concurrent changes.
    let Some(mut server) = ServersRepository::get(&mut *tx, server_id).await? else {
        return Ok(());
    };
    let old_health = server.health;

    match &stats {
        Some(stats) => {
            server.load = stats.load;
            server.mark_success(config.poll_recover);
            info!(
                target: "lb.task.poller",
                server = %server.domain,
                meetings = stats.live_internal_ids.len(),
                users = stats.users,
                load = stats.load,
                health = server.health.as_db_str(),
                "Poll complete"
            );
        }
        None => {
            server.mark_error(config.poll_fail);
        }
    }

    ServersRepository::update_poll_result(&mut tx, &server).await?;

    if old_health != server.health {
        warn!(
            target: "lb.task.poller",
            server = %server.domain,
            from = old_health.as_db_str(),
            to = server.health.as_db_str(),
            "Server health changed"
        );
    }

    // An OFFLINE server's meetings are zombies; forget them.
    if server.health == ServerHealth::Offline && old_health != ServerHealth::Offline {
        let zombies = MeetingsRepository::delete_all_for_server(&mut tx, server_id).await?;
        if zombies > 0 {
            warn!(
                target: "lb.task.poller",
                server = %server.domain,
                count = zombies,
                "Forgot zombie meetings of offline server"
            );
        }
    }

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn test_config() -> Config {
        let vars = HashMap::from([
            ("BBBLB_DOMAIN".to_string(), "lb.example.com".to_string()),
            ("BBBLB_SECRET".to_string(), "0123456789abcdef".to_string()),
            ("BBBLB_DB_URI".to_string(), "postgresql://x/y".to_string()),
            ("BBBLB_LOAD_BASE".to_string(), "1.0".to_string()),
            ("BBBLB_LOAD_USER".to_string(), "0.1".to_string()),
            ("BBBLB_LOAD_VOICE".to_string(), "0.2".to_string()),
            ("BBBLB_LOAD_VIDEO".to_string(), "0.5".to_string()),
            ("BBBLB_LOAD_PENALTY".to_string(), "10.0".to_string()),
            ("BBBLB_LOAD_COOLDOWN".to_string(), "10".to_string()),
        ]);
        Config::from_vars(&vars).unwrap()
    }

    fn meeting_fragment(participants: u32, voice: u32, video: u32, create_ms: i64) -> String {
        format!(
            "<meeting><internalMeetingID>int-1</internalMeetingID>\
             <participantCount>{participants}</participantCount>\
             <voiceParticipantCount>{voice}</voiceParticipantCount>\
             <videoCount>{video}</videoCount>\
             <createTime>{create_ms}</createTime>\
             <endTime>0</endTime></meeting>"
        )
    }

    #[test]
    fn test_meeting_load_old_meeting_has_no_penalty() {
        let config = test_config();
        let now_ms = 2_000_000_000_000;
        // Created over an hour ago, far past the 10 minute cooldown.
        let fragment = meeting_fragment(10, 5, 2, now_ms - 4_000_000);

        let load = meeting_load(&fragment, &config, now_ms);
        // 1.0 + 10*0.1 + 5*0.2 + 2*0.5 = 4.0
        assert!((load - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_meeting_load_fresh_meeting_gets_full_penalty() {
        let config = test_config();
        let now_ms = 2_000_000_000_000;
        let fragment = meeting_fragment(0, 0, 0, now_ms);

        let load = meeting_load(&fragment, &config, now_ms);
        // base 1.0 + full penalty 10.0
        assert!((load - 11.0).abs() < 1e-9);
    }

    #[test]
    fn test_meeting_load_penalty_decays_linearly() {
        let config = test_config();
        let now_ms = 2_000_000_000_000;
        // Half way through the 600s cooldown.
        let fragment = meeting_fragment(0, 0, 0, now_ms - 300_000);

        let load = meeting_load(&fragment, &config, now_ms);
        assert!((load - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_collect_stats_skips_ended_meetings() {
        let config = test_config();
        let body = "<response><returncode>SUCCESS</returncode><meetings>\
             <meeting><internalMeetingID>live</internalMeetingID>\
             <participantCount>3</participantCount><endTime>0</endTime>\
             <createTime>0</createTime></meeting>\
             <meeting><internalMeetingID>done</internalMeetingID>\
             <participantCount>9</participantCount><endTime>1700000000000</endTime>\
             <createTime>0</createTime></meeting>\
             </meetings></response>";
        let response = BbbResponse::parse(body.to_string()).unwrap();

        let known = HashMap::from([("live".to_string(), 1_i64)]);
        let stats = collect_stats(&response, &known, &config, 2_000_000_000_000, "bbb1");

        assert_eq!(
            stats.live_internal_ids,
            HashSet::from(["live".to_string()])
        );
        assert_eq!(stats.users, 3);
    }

    #[test]
    fn test_collect_stats_counts_unknown_breakouts_without_tracking() {
        let config = test_config();
        let body = "<response><returncode>SUCCESS</returncode><meetings>\
             <meeting><internalMeetingID>bk</internalMeetingID>\
             <participantCount>2</participantCount><endTime>0</endTime>\
             <createTime>0</createTime>\
             <breakout><parentMeetingID>parent-1</parentMeetingID></breakout>\
             </meeting></meetings></response>";
        let response = BbbResponse::parse(body.to_string()).unwrap();

        let stats = collect_stats(&response, &HashMap::new(), &config, 2_000_000_000_000, "bbb1");

        // Load still counts the breakout; liveness tracking includes it too.
        assert!(stats.load > 0.0);
        assert!(stats.live_internal_ids.contains("bk"));
    }
}
