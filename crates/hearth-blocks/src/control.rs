//! The `control` extension: loops, branching, waits and schedules.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use chrono::{Datelike, Local, NaiveTime, Utc, Weekday};
use cron::Schedule;
use tokio::sync::Mutex;

use hearth_workspace::{BlockContext, BlockError, Extension, ExtensionRegistry, Value};

use crate::{CONDITION, CRON, DAY, DURATION, FROM, SUBSTACK2, TIME, TIMES, TO, UNIT, VALUE};

/// Pause between rounds of the looping blocks, so a tight loop cannot
/// starve the other tasks of its tab.
const LOOP_PAUSE: Duration = Duration::from_millis(100);

/// Longest accepted wait, in seconds.
const MAX_WAIT_SECS: i64 = 3600;

/// Shortest accepted stop timeout.
const MIN_STOP_TIMEOUT: Duration = Duration::from_millis(100);

pub fn register_control(registry: &mut ExtensionRegistry) -> Result<(), BlockError> {
    registry.register(extension())
}

fn extension() -> Extension {
    let mut extension = Extension::new("control");

    extension.command("forever", |ctx: BlockContext| async move {
        let mut rounds: u64 = 0;
        while !ctx.is_stopped() {
            rounds += 1;
            ctx.set_state(format!("round {rounds}"));
            ctx.execute_child().await;
            if !ctx.sleep(LOOP_PAUSE).await {
                break;
            }
        }
        Ok(())
    });

    extension.command("repeat", |ctx: BlockContext| async move {
        let times = ctx.input_integer(TIMES).await?;
        for round in 0..times.max(0) {
            if ctx.is_stopped() {
                break;
            }
            ctx.set_state(format!("round {} of {times}", round + 1));
            ctx.execute_child().await;
            if !ctx.sleep(LOOP_PAUSE).await {
                break;
            }
        }
        Ok(())
    });

    extension.command("repeat_until", |ctx: BlockContext| async move {
        while !ctx.is_stopped() && !condition_sample(&ctx).await {
            ctx.execute_child().await;
            if !ctx.sleep(LOOP_PAUSE).await {
                break;
            }
        }
        Ok(())
    });

    extension.command("if", |ctx: BlockContext| async move {
        if condition_sample(&ctx).await {
            ctx.execute_child().await;
        }
        Ok(())
    });

    extension.command("if_else", |ctx: BlockContext| async move {
        if condition_sample(&ctx).await {
            ctx.execute_child().await;
        } else if let Ok(alternative) = ctx.input_block(SUBSTACK2) {
            alternative.execute_chain().await;
        }
        Ok(())
    });

    extension.command("wait", |ctx: BlockContext| async move {
        let seconds = ctx.input_integer(DURATION).await?;
        if !(1..=MAX_WAIT_SECS).contains(&seconds) {
            return Err(BlockError::Failure(format!(
                "wait duration must be between 1 and {MAX_WAIT_SECS} seconds, got {seconds}"
            )));
        }
        ctx.set_state(format!("waiting {seconds}s"));
        ctx.sleep(Duration::from_secs(seconds as u64)).await;
        Ok(())
    });

    extension.command("wait_until", |ctx: BlockContext| async move {
        let probe = ctx.clone();
        let lock = ctx.locks().listen_condition(ctx.node(), move || {
            let probe = probe.clone();
            async move { condition_sample(&probe).await }
        });
        ctx.set_state("waiting for condition");
        ctx.wait_on(&lock, Duration::ZERO).await;
        Ok(())
    });

    extension.event("when_condition_changed", |ctx: BlockContext| async move {
        // 0 unsampled, 1 false, 2 true; the first sample counts as a change
        let previous = Arc::new(AtomicU8::new(0));
        let probe = ctx.clone();
        let lock = {
            let previous = Arc::clone(&previous);
            ctx.locks().listen_condition(ctx.node(), move || {
                let probe = probe.clone();
                let previous = Arc::clone(&previous);
                async move {
                    let current = if condition_sample(&probe).await { 2 } else { 1 };
                    previous.swap(current, Ordering::SeqCst) != current
                }
            })
        };
        ctx.subscribe_to_lock(&lock).await;
        Ok(())
    });

    extension.event("when_value_changed", |ctx: BlockContext| async move {
        // the first sample only establishes the baseline
        let previous: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let probe = ctx.clone();
        let lock = {
            let previous = Arc::clone(&previous);
            ctx.locks().listen_condition(ctx.node(), move || {
                let probe = probe.clone();
                let previous = Arc::clone(&previous);
                async move { value_changed(&probe, &previous).await }
            })
        };
        ctx.subscribe_to_lock(&lock).await;
        Ok(())
    });

    extension.event("schedule", |ctx: BlockContext| async move {
        let every = ctx.input_integer(TIME).await?;
        let unit = ctx.field(UNIT)?;
        let period = parse_period(every, &unit)
            .ok_or_else(|| BlockError::Failure(format!("cannot schedule every {every} <{unit}>")))?;
        let mut rounds: u64 = 0;
        while !ctx.is_stopped() {
            rounds += 1;
            ctx.set_state(format!("run {rounds}"));
            ctx.execute_next_chain().await;
            ctx.set_state(format!("sleeping {}s", period.as_secs()));
            if !ctx.sleep(period).await {
                break;
            }
        }
        Ok(())
    });

    extension.event("schedule_cron", |ctx: BlockContext| async move {
        let raw = ctx.input_string(CRON, "").await?;
        let schedule = parse_cron(&raw)
            .map_err(|err| BlockError::Failure(format!("bad cron expression <{raw}>: {err}")))?;
        while !ctx.is_stopped() {
            let Some(next) = schedule.upcoming(Utc).next() else {
                ctx.set_state("schedule exhausted");
                break;
            };
            ctx.set_state(format!("next run {}", next.to_rfc3339()));
            let pause = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if !ctx.sleep(pause).await {
                break;
            }
            ctx.execute_next_chain().await;
        }
        Ok(())
    });

    extension.command("stop", |ctx: BlockContext| async move {
        ctx.set_state("stopped");
        ctx.halt_task();
        Ok(())
    });

    // Arms a timer that halts the owning task once it fires; the chain keeps
    // running in the meantime.
    extension.command("stop_timeout", |ctx: BlockContext| async move {
        let times = ctx.input_integer(TIMES).await?;
        let unit = ctx.field(UNIT)?;
        let period = parse_period(times, &unit)
            .ok_or_else(|| BlockError::Failure(format!("cannot stop after {times} <{unit}>")))?
            .max(MIN_STOP_TIMEOUT);
        let timer = ctx.clone();
        tokio::spawn(async move {
            if timer.sleep(period).await {
                timer.set_state("timed out");
                timer.halt_task();
            }
        });
        Ok(())
    });

    extension.event("when_time_between", |ctx: BlockContext| async move {
        let raw_from = ctx.input_string(FROM, "").await?;
        let from = parse_clock(&raw_from)
            .ok_or_else(|| BlockError::Failure(format!("bad time of day <{raw_from}>")))?;
        let raw_to = ctx.input_string(TO, "").await?;
        let to = parse_clock(&raw_to)
            .ok_or_else(|| BlockError::Failure(format!("bad time of day <{raw_to}>")))?;
        let raw_days = ctx.field(DAY).unwrap_or_else(|_| "ANY".to_string());
        let days = parse_days(&raw_days)
            .ok_or_else(|| BlockError::Failure(format!("bad day selection <{raw_days}>")))?;
        let lock = ctx.locks().listen_condition(ctx.node(), move || {
            let days = days.clone();
            async move {
                let now = Local::now();
                days.contains(&now.weekday()) && in_time_range(now.time(), from, to)
            }
        });
        ctx.subscribe_to_lock(&lock).await;
        Ok(())
    });

    extension
}

/// Read the CONDITION input as a boolean. Absent and broken conditions
/// read as false so pollers and gates keep running.
async fn condition_sample(ctx: &BlockContext) -> bool {
    if !ctx.has_input(CONDITION) {
        return false;
    }
    match ctx.input_boolean(CONDITION).await {
        Ok(state) => state,
        Err(err) => {
            tracing::debug!(node = %ctx.id(), %err, "condition sample failed");
            false
        }
    }
}

async fn value_changed(ctx: &BlockContext, previous: &Mutex<Option<Value>>) -> bool {
    let current = match ctx.input_value(VALUE).await {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(node = %ctx.id(), %err, "value sample failed");
            return false;
        }
    };
    let mut guard = previous.lock().await;
    match guard.as_ref() {
        Some(last) if *last == current => false,
        Some(_) => {
            *guard = Some(current.clone());
            ctx.set_value(current);
            true
        }
        None => {
            *guard = Some(current);
            false
        }
    }
}

fn parse_period(every: i64, unit: &str) -> Option<Duration> {
    if every <= 0 {
        return None;
    }
    let every = every as u64;
    let unit = unit.trim().to_ascii_uppercase();
    let millis = if unit.starts_with("MILLI") {
        every
    } else if unit.starts_with("SEC") {
        every * 1_000
    } else if unit.starts_with("MIN") {
        every * 60_000
    } else if unit.starts_with("HOUR") {
        every * 3_600_000
    } else if unit.starts_with("DAY") {
        every * 86_400_000
    } else {
        return None;
    };
    Some(Duration::from_millis(millis))
}

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    let raw = raw.trim();
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

/// Day selections are saved as `MON --> FRI` style ranges or the `ANY`
/// wildcard.
fn parse_days(raw: &str) -> Option<Vec<Weekday>> {
    const WEEK: [Weekday; 7] = [
        Weekday::Mon,
        Weekday::Tue,
        Weekday::Wed,
        Weekday::Thu,
        Weekday::Fri,
        Weekday::Sat,
        Weekday::Sun,
    ];
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("ANY") || raw.is_empty() {
        return Some(WEEK.to_vec());
    }
    let (first, last) = match raw.split_once("-->") {
        Some((first, last)) => (first.trim().parse::<Weekday>().ok()?, {
            let last = last.trim();
            if last.eq_ignore_ascii_case("ANY") {
                Weekday::Sun
            } else {
                last.parse::<Weekday>().ok()?
            }
        }),
        None => {
            let day = raw.parse::<Weekday>().ok()?;
            (day, day)
        }
    };
    let start = WEEK.iter().position(|day| *day == first)?;
    let end = WEEK.iter().position(|day| *day == last)?;
    let mut days = Vec::new();
    let mut at = start;
    loop {
        days.push(WEEK[at]);
        if at == end {
            break;
        }
        at = (at + 1) % 7;
    }
    Some(days)
}

/// A range whose start is after its end wraps across midnight; a range
/// with equal endpoints is always in effect.
fn in_time_range(now: NaiveTime, from: NaiveTime, to: NaiveTime) -> bool {
    match from.cmp(&to) {
        std::cmp::Ordering::Less => now >= from && now < to,
        std::cmp::Ordering::Greater => now >= from || now < to,
        std::cmp::Ordering::Equal => true,
    }
}

/// Editors save the classic five field form; the parser wants seconds and
/// year fields as well.
fn parse_cron(raw: &str) -> Result<Schedule, cron::error::Error> {
    let raw = raw.trim();
    let expanded = match raw.split_whitespace().count() {
        5 => format!("0 {raw} *"),
        6 => format!("{raw} *"),
        _ => raw.to_string(),
    };
    Schedule::from_str(&expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_workspace::{EngineSettings, NotificationLevel, WorkspaceManager};
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn manager_with(extra: Extension) -> WorkspaceManager {
        let mut registry = ExtensionRegistry::new();
        register_control(&mut registry).unwrap();
        registry.register(extra).unwrap();
        WorkspaceManager::with_settings(
            registry,
            EngineSettings {
                teardown_grace: Duration::from_millis(500),
                poll_interval: Duration::from_millis(30),
            },
        )
    }

    fn marking_extension(fired: &Arc<AtomicUsize>) -> Extension {
        let mut extension = Extension::new("probe");
        let fired = Arc::clone(fired);
        extension.command("mark", move |_ctx| {
            let fired = Arc::clone(&fired);
            async move {
                fired.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        extension
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn repeat_runs_the_child_the_saved_number_of_times() {
        let fired = Arc::new(AtomicUsize::new(0));
        let manager = manager_with(marking_extension(&fired));
        let content = json!({"target": {"blocks": {
            "top": {"opcode": "control_repeat", "topLevel": true,
                    "inputs": {"TIMES": [1, [6, "3"]], "SUBSTACK": [2, "c1"]}},
            "c1": {"opcode": "probe_mark", "parent": "top"}
        }}})
        .to_string();
        manager.load_tab("tab1", &content).await.unwrap();

        let probe = Arc::clone(&fired);
        eventually("three rounds", move || probe.load(Ordering::SeqCst) == 3).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn forever_loops_until_the_tab_is_removed() {
        let fired = Arc::new(AtomicUsize::new(0));
        let manager = manager_with(marking_extension(&fired));
        let content = json!({"target": {"blocks": {
            "top": {"opcode": "control_forever", "topLevel": true,
                    "inputs": {"SUBSTACK": [2, "c1"]}},
            "c1": {"opcode": "probe_mark", "parent": "top"}
        }}})
        .to_string();
        manager.load_tab("tab1", &content).await.unwrap();

        let probe = Arc::clone(&fired);
        eventually("a few rounds", move || probe.load(Ordering::SeqCst) >= 2).await;
        manager.remove_tab("tab1").await;
        let settled = fired.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), settled);
    }

    #[tokio::test]
    async fn if_else_picks_the_matching_branch() {
        let taken = Arc::new(StdMutex::new(Vec::new()));
        let mut extension = Extension::new("probe");
        for (opcode, token) in [("then", "then"), ("other", "else")] {
            let taken = Arc::clone(&taken);
            extension.command(opcode, move |_ctx| {
                let taken = Arc::clone(&taken);
                async move {
                    taken.lock().unwrap().push(token);
                    Ok(())
                }
            });
        }
        let manager = manager_with(extension);

        let tab = |checked: bool| {
            json!({"target": {"blocks": {
                "top": {"opcode": "control_if_else", "topLevel": true,
                        "inputs": {"CONDITION": [1, [8, checked]],
                                   "SUBSTACK": [2, "t1"], "SUBSTACK2": [2, "e1"]}},
                "t1": {"opcode": "probe_then", "parent": "top"},
                "e1": {"opcode": "probe_other", "parent": "top"}
            }}})
            .to_string()
        };
        manager.load_tab("tab1", &tab(true)).await.unwrap();
        let probe = Arc::clone(&taken);
        eventually("then branch", move || probe.lock().unwrap().len() == 1).await;

        manager.load_tab("tab2", &tab(false)).await.unwrap();
        let probe = Arc::clone(&taken);
        eventually("else branch", move || probe.lock().unwrap().len() == 2).await;
        assert_eq!(*taken.lock().unwrap(), vec!["then", "else"]);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn wait_rejects_out_of_range_durations() {
        let fired = Arc::new(AtomicUsize::new(0));
        let manager = manager_with(marking_extension(&fired));
        let mut notifications = manager.notifier().subscribe();
        let content = json!({"target": {"blocks": {
            "top": {"opcode": "control_wait", "topLevel": true, "next": "c1",
                    "inputs": {"DURATION": [1, [4, "0"]]}},
            "c1": {"opcode": "probe_mark", "parent": "top"}
        }}})
        .to_string();
        manager.load_tab("tab1", &content).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.level, NotificationLevel::Error);
        assert_eq!(report.node_id.as_deref(), Some("top"));
        assert!(report.message.contains("wait duration"));
        // the failing block halted its chain
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn wait_until_unparks_when_the_condition_turns_true() {
        let flag = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicUsize::new(0));
        let mut extension = marking_extension(&fired);
        {
            let flag = Arc::clone(&flag);
            extension.expression("flag", move |_ctx| {
                let flag = Arc::clone(&flag);
                async move { Ok(Value::Bool(flag.load(Ordering::SeqCst))) }
            });
        }
        let manager = manager_with(extension);
        let content = json!({"target": {"blocks": {
            "top": {"opcode": "control_wait_until", "topLevel": true, "next": "c1",
                    "inputs": {"CONDITION": [2, "f1"]}},
            "f1": {"opcode": "probe_flag", "parent": "top"},
            "c1": {"opcode": "probe_mark", "parent": "top"}
        }}})
        .to_string();
        manager.load_tab("tab1", &content).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        flag.store(true, Ordering::SeqCst);
        let probe = Arc::clone(&fired);
        eventually("chain after wait_until", move || probe.load(Ordering::SeqCst) == 1).await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn repeat_until_stops_once_the_condition_holds() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut extension = marking_extension(&fired);
        {
            let fired = Arc::clone(&fired);
            extension.expression("done", move |_ctx| {
                let fired = Arc::clone(&fired);
                async move { Ok(Value::Bool(fired.load(Ordering::SeqCst) >= 3)) }
            });
        }
        let manager = manager_with(extension);
        let content = json!({"target": {"blocks": {
            "top": {"opcode": "control_repeat_until", "topLevel": true,
                    "inputs": {"CONDITION": [2, "d1"], "SUBSTACK": [2, "c1"]}},
            "d1": {"opcode": "probe_done", "parent": "top"},
            "c1": {"opcode": "probe_mark", "parent": "top"}
        }}})
        .to_string();
        manager.load_tab("tab1", &content).await.unwrap();

        let probe = Arc::clone(&fired);
        eventually("three rounds", move || probe.load(Ordering::SeqCst) >= 3).await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn when_value_changed_fires_per_distinct_sample() {
        let reading = Arc::new(StdMutex::new(0.0_f64));
        let fired = Arc::new(AtomicUsize::new(0));
        let mut extension = marking_extension(&fired);
        {
            let reading = Arc::clone(&reading);
            extension.expression("sensor", move |_ctx| {
                let reading = Arc::clone(&reading);
                async move { Ok(Value::Number(*reading.lock().unwrap())) }
            });
        }
        let manager = manager_with(extension);
        let content = json!({"target": {"blocks": {
            "hat": {"opcode": "control_when_value_changed", "topLevel": true, "next": "c1",
                    "inputs": {"VALUE": [2, "s1"]}},
            "s1": {"opcode": "probe_sensor", "parent": "hat"},
            "c1": {"opcode": "probe_mark", "parent": "hat"}
        }}})
        .to_string();
        manager.load_tab("tab1", &content).await.unwrap();

        // the baseline sample must not fire
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        *reading.lock().unwrap() = 21.5;
        let probe = Arc::clone(&fired);
        eventually("first change", move || probe.load(Ordering::SeqCst) == 1).await;

        // a steady reading must not re-fire
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        *reading.lock().unwrap() = 23.0;
        let probe = Arc::clone(&fired);
        eventually("second change", move || probe.load(Ordering::SeqCst) == 2).await;

        let hat = manager.block_by_id("tab1", "hat").await.unwrap();
        assert_eq!(hat.last_value(), Some(Value::Number(23.0)));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn when_condition_changed_fires_on_every_flip() {
        let flag = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicUsize::new(0));
        let mut extension = marking_extension(&fired);
        {
            let flag = Arc::clone(&flag);
            extension.expression("flag", move |_ctx| {
                let flag = Arc::clone(&flag);
                async move { Ok(Value::Bool(flag.load(Ordering::SeqCst))) }
            });
        }
        let manager = manager_with(extension);
        let content = json!({"target": {"blocks": {
            "hat": {"opcode": "control_when_condition_changed", "topLevel": true, "next": "c1",
                    "inputs": {"CONDITION": [2, "f1"]}},
            "f1": {"opcode": "probe_flag", "parent": "hat"},
            "c1": {"opcode": "probe_mark", "parent": "hat"}
        }}})
        .to_string();
        manager.load_tab("tab1", &content).await.unwrap();

        // the first sample counts as a change
        let probe = Arc::clone(&fired);
        eventually("first sample", move || probe.load(Ordering::SeqCst) == 1).await;

        flag.store(true, Ordering::SeqCst);
        let probe = Arc::clone(&fired);
        eventually("flip to true", move || probe.load(Ordering::SeqCst) == 2).await;

        flag.store(false, Ordering::SeqCst);
        let probe = Arc::clone(&fired);
        eventually("flip back", move || probe.load(Ordering::SeqCst) == 3).await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn schedule_runs_first_and_then_periodically() {
        let fired = Arc::new(AtomicUsize::new(0));
        let manager = manager_with(marking_extension(&fired));
        let content = json!({"target": {"blocks": {
            "hat": {"opcode": "control_schedule", "topLevel": true, "next": "c1",
                    "inputs": {"TIME": [1, [7, "1"]]}, "fields": {"UNIT": ["seconds"]}},
            "c1": {"opcode": "probe_mark", "parent": "hat"}
        }}})
        .to_string();
        manager.load_tab("tab1", &content).await.unwrap();

        // the first run happens right away
        let probe = Arc::clone(&fired);
        eventually("first run", move || probe.load(Ordering::SeqCst) >= 1).await;
        let probe = Arc::clone(&fired);
        eventually("second run", move || probe.load(Ordering::SeqCst) >= 2).await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn schedule_cron_fires_on_the_schedule() {
        let fired = Arc::new(AtomicUsize::new(0));
        let manager = manager_with(marking_extension(&fired));
        let content = json!({"target": {"blocks": {
            "hat": {"opcode": "control_schedule_cron", "topLevel": true, "next": "c1",
                    "inputs": {"CRON": [1, [10, "* * * * * *"]]}},
            "c1": {"opcode": "probe_mark", "parent": "hat"}
        }}})
        .to_string();
        manager.load_tab("tab1", &content).await.unwrap();

        let probe = Arc::clone(&fired);
        eventually("cron tick", move || probe.load(Ordering::SeqCst) >= 1).await;
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn schedule_cron_reports_a_bad_expression() {
        let fired = Arc::new(AtomicUsize::new(0));
        let manager = manager_with(marking_extension(&fired));
        let mut notifications = manager.notifier().subscribe();
        let content = json!({"target": {"blocks": {
            "hat": {"opcode": "control_schedule_cron", "topLevel": true,
                    "inputs": {"CRON": [1, [10, "every tuesday"]]}}
        }}})
        .to_string();
        manager.load_tab("tab1", &content).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(2), notifications.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.level, NotificationLevel::Error);
        assert!(report.message.contains("bad cron expression"));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stop_halts_the_rest_of_the_chain() {
        let fired = Arc::new(AtomicUsize::new(0));
        let manager = manager_with(marking_extension(&fired));
        let content = json!({"target": {"blocks": {
            "a": {"opcode": "probe_mark", "topLevel": true, "next": "b"},
            "b": {"opcode": "control_stop", "parent": "a", "next": "c"},
            "c": {"opcode": "probe_mark", "parent": "b"}
        }}})
        .to_string();
        manager.load_tab("tab1", &content).await.unwrap();

        let probe = Arc::clone(&fired);
        eventually("first mark", move || probe.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stop_timeout_halts_a_running_loop() {
        let fired = Arc::new(AtomicUsize::new(0));
        let manager = manager_with(marking_extension(&fired));
        let content = json!({"target": {"blocks": {
            "top": {"opcode": "control_stop_timeout", "topLevel": true, "next": "loop",
                    "inputs": {"TIMES": [1, [6, "200"]]},
                    "fields": {"UNIT": ["MILLISECONDS"]}},
            "loop": {"opcode": "control_forever", "parent": "top",
                     "inputs": {"SUBSTACK": [2, "c1"]}},
            "c1": {"opcode": "probe_mark", "parent": "loop"}
        }}})
        .to_string();
        manager.load_tab("tab1", &content).await.unwrap();

        let probe = Arc::clone(&fired);
        eventually("the loop started", move || probe.load(Ordering::SeqCst) >= 1).await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        let settled = fired.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fired.load(Ordering::SeqCst), settled);
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn when_time_between_fires_inside_the_window_only() {
        let fired = Arc::new(AtomicUsize::new(0));
        let manager = manager_with(marking_extension(&fired));
        let clock = |offset: chrono::Duration| (Local::now() + offset).format("%H:%M").to_string();

        let around_now = json!({"target": {"blocks": {
            "hat": {"opcode": "control_when_time_between", "topLevel": true, "next": "c1",
                    "inputs": {"FROM": [1, [10, clock(-chrono::Duration::hours(1))]],
                               "TO": [1, [10, clock(chrono::Duration::hours(1))]]},
                    "fields": {"DAY": ["ANY"]}},
            "c1": {"opcode": "probe_mark", "parent": "hat"}
        }}})
        .to_string();
        manager.load_tab("tab1", &around_now).await.unwrap();
        let probe = Arc::clone(&fired);
        eventually("the open window fired", move || probe.load(Ordering::SeqCst) == 1).await;
        manager.remove_tab("tab1").await;

        let later = json!({"target": {"blocks": {
            "hat": {"opcode": "control_when_time_between", "topLevel": true, "next": "c1",
                    "inputs": {"FROM": [1, [10, clock(chrono::Duration::hours(1))]],
                               "TO": [1, [10, clock(chrono::Duration::hours(2))]]},
                    "fields": {"DAY": ["ANY"]}},
            "c1": {"opcode": "probe_mark", "parent": "hat"}
        }}})
        .to_string();
        manager.load_tab("tab2", &later).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        manager.shutdown().await;
    }

    #[test]
    fn periods_accept_unit_prefixes() {
        assert_eq!(parse_period(5, "seconds"), Some(Duration::from_secs(5)));
        assert_eq!(parse_period(2, "MINUTES"), Some(Duration::from_secs(120)));
        assert_eq!(parse_period(1, "Hours"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_period(1, "day"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_period(250, "milliseconds"), Some(Duration::from_millis(250)));
        assert_eq!(parse_period(0, "seconds"), None);
        assert_eq!(parse_period(3, "fortnights"), None);
    }

    #[test]
    fn clock_strings_parse_with_and_without_seconds() {
        assert_eq!(parse_clock("06:30"), NaiveTime::from_hms_opt(6, 30, 0));
        assert_eq!(parse_clock("22:00:15"), NaiveTime::from_hms_opt(22, 0, 15));
        assert_eq!(parse_clock("late"), None);
    }

    #[test]
    fn day_selections_cover_wildcards_and_ranges() {
        assert_eq!(parse_days("ANY").unwrap().len(), 7);
        assert_eq!(
            parse_days("MON --> FRI").unwrap(),
            vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]
        );
        // ranges wrap past the end of the week
        assert_eq!(
            parse_days("SAT --> MON").unwrap(),
            vec![Weekday::Sat, Weekday::Sun, Weekday::Mon]
        );
        assert_eq!(parse_days("WED").unwrap(), vec![Weekday::Wed]);
        assert_eq!(parse_days("SOMEDAY"), None);
    }

    #[test]
    fn time_ranges_handle_midnight_wraps() {
        let at = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert!(in_time_range(at(12, 0), at(9, 0), at(17, 0)));
        assert!(!in_time_range(at(18, 0), at(9, 0), at(17, 0)));
        // 22:00 to 06:00 spans midnight
        assert!(in_time_range(at(23, 30), at(22, 0), at(6, 0)));
        assert!(in_time_range(at(2, 0), at(22, 0), at(6, 0)));
        assert!(!in_time_range(at(12, 0), at(22, 0), at(6, 0)));
        // equal endpoints never close the window
        assert!(in_time_range(at(4, 0), at(8, 0), at(8, 0)));
    }

    #[test]
    fn cron_expressions_are_expanded_to_seven_fields() {
        // five, six and seven field forms all parse
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("30 4 * * 1-5").is_ok());
        assert!(parse_cron("0 30 4 * * 1-5").is_ok());
        assert!(parse_cron("* * * * * * *").is_ok());
        assert!(parse_cron("every tuesday").is_err());
    }
}
