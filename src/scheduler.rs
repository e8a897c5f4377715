//! Touch Sequence Scheduler: business-hours/weekday gating,
//! daily send caps, and per-lead `ScheduledStep` advancement.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use overlord_store::id::{CampaignId, LeadId};
use overlord_store::models::{Campaign, CampaignSettings, ScheduledStep};
use overlord_store::{Store, StoreResult};

/// Whether `at` falls inside the campaign's configured send window. An
/// empty `allowed_weekdays` set means every day is allowed.
pub fn is_within_business_window(settings: &CampaignSettings, at: DateTime<Utc>) -> bool {
    let local = local_time(settings, at);
    let hour = local.hour();
    let in_hours = if settings.start_hour <= settings.end_hour {
        hour >= settings.start_hour as u32 && hour < settings.end_hour as u32
    } else {
        // Window wraps midnight (e.g. 20:00-02:00).
        hour >= settings.start_hour as u32 || hour < settings.end_hour as u32
    };
    let weekday_ok = settings.allowed_weekdays.is_empty() || settings.allowed_weekdays.contains(&local.weekday());
    in_hours && weekday_ok
}

fn local_time(settings: &CampaignSettings, at: DateTime<Utc>) -> DateTime<chrono_tz::Tz> {
    let tz: chrono_tz::Tz = settings.timezone.parse().unwrap_or(chrono_tz::UTC);
    at.with_timezone(&tz)
}

/// Walk forward hour by hour until `is_within_business_window` holds, or
/// give up after two weeks and return `from` unchanged (defensive — a
/// misconfigured window should never wedge the scheduler forever).
pub fn next_allowed_time(settings: &CampaignSettings, from: DateTime<Utc>) -> DateTime<Utc> {
    let mut candidate = from;
    for _ in 0..(24 * 14) {
        if is_within_business_window(settings, candidate) {
            return candidate;
        }
        candidate += chrono::Duration::hours(1);
    }
    from
}

/// Enroll a freshly routed lead into its campaign's touch sequence. A
/// no-op for `ai_only` conversations (those leads never touch the fixed
/// sequence) or campaigns with fewer than two steps.
///
/// Called right after step 0 has already been dispatched as the lead's
/// `Initial` message (`engine.rs`'s `process_dispatch` sends
/// `touch_sequence[0]` immediately on routing, outside the scheduler).
/// So there's nothing left to enroll here but step 1 onward: next-fire is
/// computed off step 1's own delay from roughly step 0's send time, and
/// `current_index` starts at 1 so the scheduler never re-fires the step
/// the engine already dispatched.
pub async fn enroll(store: &Store, lead_id: LeadId, campaign: &Campaign) -> StoreResult<()> {
    if campaign.conversation_mode == overlord_store::models::ConversationMode::AiOnly {
        return Ok(());
    }
    let Some(next_step) = campaign.touch_sequence.get(1) else { return Ok(()) };

    let fire_at = next_allowed_time(&campaign.settings, Utc::now() + next_step.delay_unit.to_duration(next_step.delay_amount));
    let step = ScheduledStep {
        lead_id,
        campaign_id: campaign.id,
        current_index: 1,
        next_fire_at: Some(fire_at),
        canceled: false,
        version: 0,
    };
    store.upsert_scheduled_step(&step).await?;
    Ok(())
}

/// Cancel a lead's remaining touch sequence — called the moment a reply
/// arrives on an `auto` conversation, since a reply suspends the
/// remaining touch sequence.
pub async fn cancel_on_reply(store: &Store, lead_id: LeadId, campaign_id: CampaignId) -> StoreResult<()> {
    let Some(step) = store.get_scheduled_step(lead_id, campaign_id).await? else { return Ok(()) };
    if step.canceled {
        return Ok(());
    }
    let canceled = ScheduledStep { canceled: true, next_fire_at: None, ..step };
    store.upsert_scheduled_step(&canceled).await?;
    Ok(())
}

/// Advance `step` past `fired_index` to the next touch, or mark the
/// sequence exhausted once `touch_sequence` runs out. `daily_cap_reached`
/// defers to tomorrow's window instead of advancing.
pub fn advance(step: &ScheduledStep, campaign: &Campaign, fired_index: i64, daily_cap_reached: bool) -> ScheduledStep {
    if daily_cap_reached {
        let tomorrow = next_allowed_time(&campaign.settings, Utc::now() + chrono::Duration::days(1));
        return ScheduledStep { next_fire_at: Some(tomorrow), ..step.clone() };
    }

    let next_index = fired_index + 1;
    match campaign.touch_sequence.get(next_index as usize) {
        Some(next_touch) => {
            let fire_at = next_allowed_time(&campaign.settings, Utc::now() + next_touch.delay_unit.to_duration(next_touch.delay_amount));
            ScheduledStep { current_index: next_index, next_fire_at: Some(fire_at), ..step.clone() }
        }
        None => ScheduledStep { current_index: next_index, next_fire_at: None, canceled: true, ..step.clone() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn settings(start: u8, end: u8, days: &[chrono::Weekday]) -> CampaignSettings {
        CampaignSettings {
            handover_criteria: overlord_store::models::HandoverCriteria {
                qualification_score_threshold: 100.0,
                conversation_length_threshold: 1000,
                time_threshold_seconds: i64::MAX,
                keyword_triggers: HashSet::new(),
                goal_completion_required: HashSet::new(),
                handover_recipients: vec![],
            },
            start_hour: start,
            end_hour: end,
            allowed_weekdays: days.iter().copied().collect(),
            daily_send_cap: None,
            send_time_optimization: false,
            timezone: "UTC".to_string(),
        }
    }

    #[test]
    fn outside_business_hours_is_rejected() {
        let settings = settings(9, 17, &[]);
        let at = Utc.with_ymd_and_hms(2026, 1, 5, 3, 0, 0).unwrap();
        assert!(!is_within_business_window(&settings, at));
    }

    #[test]
    fn inside_business_hours_on_allowed_day_passes() {
        let settings = settings(9, 17, &[chrono::Weekday::Mon]);
        let at = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap(); // a Monday
        assert!(is_within_business_window(&settings, at));
    }

    #[test]
    fn disallowed_weekday_is_rejected_even_in_hours() {
        let settings = settings(9, 17, &[chrono::Weekday::Tue]);
        let at = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap(); // a Monday
        assert!(!is_within_business_window(&settings, at));
    }

    #[test]
    fn next_allowed_time_walks_forward_to_window() {
        let settings = settings(9, 17, &[]);
        let at = Utc.with_ymd_and_hms(2026, 1, 5, 3, 0, 0).unwrap();
        let allowed = next_allowed_time(&settings, at);
        assert!(is_within_business_window(&settings, allowed));
        assert!(allowed > at);
    }
}
