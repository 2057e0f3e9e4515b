use chrono::{DateTime, TimeDelta, Utc};
use shared::domain::{PropertyState, IMAGER_AGENT, MOUNT_AGENT};

use crate::store::PropertyTable;

pub const SEQUENCE_SLOTS: usize = 16;
pub const SECONDS_PER_DAY: f64 = 86_400.0;

const SEQUENCE_GROUP: &str = "AGENT_IMAGER_SEQUENCE";
const SEQUENCE_ORDER_ITEM: &str = "SEQUENCE";
const STATS_GROUP: &str = "AGENT_IMAGER_STATS";
const START_GROUP: &str = "AGENT_START_PROCESS";
const START_SEQUENCE_ITEM: &str = "SEQUENCE";
const PAUSE_GROUP: &str = "AGENT_PAUSE_PROCESS";
const PAUSE_ITEM: &str = "PAUSE";
const LIMITS_GROUP: &str = "AGENT_LIMITS";
const HA_TRACKING_ITEM: &str = "HA_TRACKING";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SequencePlan {
    pub exposure_seconds: f64,
    pub count: f64,
    pub filter: String,
}

impl SequencePlan {
    /// Applies a `key=value;` slot string on top of `self`. Fields the string
    /// omits keep their current values.
    pub fn merged(&self, raw: &str) -> Self {
        let mut plan = self.clone();
        for (name, value) in raw
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .map(|(name, value)| (name.trim(), value.trim()))
        {
            match name.to_ascii_lowercase().as_str() {
                "exposure" => {
                    if let Some(seconds) = finite(value) {
                        plan.exposure_seconds = seconds;
                    }
                }
                "count" => {
                    if let Some(count) = finite(value) {
                        plan.count = count;
                    }
                }
                "filter" => plan.filter = value.to_string(),
                _ => {}
            }
        }
        plan
    }

    pub fn duration_seconds(&self) -> f64 {
        self.exposure_seconds * self.count
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    Stopped,
    Sequencing,
    Paused,
}

impl SequenceStatus {
    pub fn is_active(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventOffset {
    pub from_now: f64,
    pub from_sequence_start: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceProgress {
    pub status: SequenceStatus,
    pub plans: Vec<SequencePlan>,
    pub run: Vec<usize>,
    pub total_seconds: f64,
    pub elapsed_seconds: f64,
    pub total_images: f64,
    pub images_taken: f64,
    pub current_exposure_fraction: Option<f64>,
    pub current_filter: Option<String>,
    pub imager_start: DateTime<Utc>,
    pub imager_finish: DateTime<Utc>,
    pub meridian: Option<EventOffset>,
    pub hour_angle_limit: Option<EventOffset>,
}

pub fn sequence_plans(table: &PropertyTable) -> Vec<SequencePlan> {
    let mut keep = SequencePlan::default();
    let mut plans = Vec::with_capacity(SEQUENCE_SLOTS);
    for slot in 1..=SEQUENCE_SLOTS {
        if let Some(record) = table.lookup(IMAGER_AGENT, SEQUENCE_GROUP, &format!("{slot:02}")) {
            keep = keep.merged(&record.value);
        }
        plans.push(keep.clone());
    }
    plans
}

pub fn sequence_run(order: &str) -> Vec<usize> {
    order
        .split(';')
        .filter_map(|entry| entry.trim().parse::<usize>().ok())
        .filter(|slot| (1..=SEQUENCE_SLOTS).contains(slot))
        .collect()
}

pub fn sequence_status(table: &PropertyTable) -> SequenceStatus {
    let running = table
        .lookup(IMAGER_AGENT, START_GROUP, START_SEQUENCE_ITEM)
        .is_some_and(|record| record.state == PropertyState::Busy);
    if !running {
        return SequenceStatus::Stopped;
    }
    let paused = table
        .lookup(IMAGER_AGENT, PAUSE_GROUP, PAUSE_ITEM)
        .is_some_and(|record| record.state == PropertyState::Busy || record.is_on());
    if paused {
        SequenceStatus::Paused
    } else {
        SequenceStatus::Sequencing
    }
}

pub fn wrap_day_seconds(seconds: f64) -> f64 {
    let wrapped = seconds.rem_euclid(SECONDS_PER_DAY);
    // rem_euclid can round up to the modulus for tiny negative inputs.
    if wrapped >= SECONDS_PER_DAY {
        0.0
    } else {
        wrapped
    }
}

fn finite(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|value| value.is_finite())
}

fn stat(table: &PropertyTable, item: &str) -> Option<f64> {
    table
        .lookup(IMAGER_AGENT, STATS_GROUP, item)?
        .value_f64()
        .filter(|value| value.is_finite())
}

pub fn compute_progress(table: &PropertyTable, now: DateTime<Utc>) -> SequenceProgress {
    let plans = sequence_plans(table);
    let run = table
        .lookup(IMAGER_AGENT, SEQUENCE_GROUP, SEQUENCE_ORDER_ITEM)
        .map(|record| sequence_run(&record.value))
        .unwrap_or_default();
    let status = sequence_status(table);

    let mut total_seconds = 0.0;
    let mut total_images = 0.0;
    for slot in &run {
        let plan = &plans[slot - 1];
        total_seconds += plan.duration_seconds();
        total_images += plan.count;
    }

    let mut elapsed_seconds = 0.0;
    let mut images_taken = 0.0;
    let mut current_exposure_fraction = None;
    let mut current_filter = None;

    if status.is_active() {
        let batch = stat(table, "BATCH").unwrap_or(0.0);
        let frame = stat(table, "FRAME").unwrap_or(0.0);
        let remaining = stat(table, "EXPOSURE").unwrap_or(0.0);

        for (index, slot) in run.iter().enumerate() {
            let plan = &plans[slot - 1];
            let position = (index + 1) as f64;
            if position < batch {
                elapsed_seconds += plan.duration_seconds();
                images_taken += plan.count;
            } else if position == batch {
                let exposure = plan.exposure_seconds;
                let remaining = remaining.clamp(0.0, exposure.max(0.0));
                let finished_frames = (frame - 1.0).clamp(0.0, plan.count.max(0.0));
                elapsed_seconds += exposure * finished_frames + (exposure - remaining);
                images_taken += frame.clamp(0.0, plan.count.max(0.0));
                current_exposure_fraction = Some(if exposure > 0.0 {
                    (exposure - remaining) / exposure
                } else {
                    0.0
                });
                current_filter = Some(plan.filter.clone());
            }
        }
    }

    // Times that do not fit a timestamp collapse to `now`.
    let (imager_start, imager_finish) = if status.is_active() {
        (
            shifted(now, -elapsed_seconds),
            shifted(now, total_seconds - elapsed_seconds),
        )
    } else {
        (now, shifted(now, total_seconds))
    };

    let shift = if status.is_active() {
        elapsed_seconds
    } else {
        0.0
    };
    let hour_angle = table.lookup(MOUNT_AGENT, LIMITS_GROUP, HA_TRACKING_ITEM);
    let meridian = hour_angle
        .and_then(|record| record.value_f64())
        .filter(|ha| ha.is_finite())
        .map(|ha| event_offset((24.0 - ha) * 3600.0, shift));
    let hour_angle_limit = hour_angle.and_then(|record| {
        let ha = record.value_f64().filter(|ha| ha.is_finite())?;
        let limit = record.target_f64().filter(|limit| limit.is_finite())?;
        Some(event_offset((limit - ha) * 3600.0, shift))
    });

    SequenceProgress {
        status,
        plans,
        run,
        total_seconds,
        elapsed_seconds,
        total_images,
        images_taken,
        current_exposure_fraction,
        current_filter,
        imager_start,
        imager_finish,
        meridian,
        hour_angle_limit,
    }
}

fn event_offset(raw_seconds: f64, shift: f64) -> EventOffset {
    let from_now = wrap_day_seconds(raw_seconds);
    EventOffset {
        from_now,
        from_sequence_start: from_now + shift,
    }
}

fn shifted(now: DateTime<Utc>, seconds: f64) -> DateTime<Utc> {
    let millis = (seconds * 1000.0).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return now;
    }
    TimeDelta::try_milliseconds(millis as i64)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now)
}

#[cfg(test)]
#[path = "tests/progress_tests.rs"]
mod tests;
