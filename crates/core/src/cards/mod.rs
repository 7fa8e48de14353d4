//! TaskCards: persisted, approvable units of deferred automated work.

mod engine;

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use engine::{CardEngine, CardError, CardTransition, Completion};

use crate::identity::TenantId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskCardId(pub String);

impl std::fmt::Display for TaskCardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    AiSuggested,
    Risk,
    Absence,
    Counseling,
    NewSignup,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AiSuggested => "ai_suggested",
            Self::Risk => "risk",
            Self::Absence => "absence",
            Self::Counseling => "counseling",
            Self::NewSignup => "new_signup",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ai_suggested" => Some(Self::AiSuggested),
            "risk" => Some(Self::Risk),
            "absence" => Some(Self::Absence),
            "counseling" => Some(Self::Counseling),
            "new_signup" => Some(Self::NewSignup),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Pending,
    Approved,
    Executed,
    Expired,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Executed => "executed",
            Self::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "executed" => Some(Self::Executed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Executed and expired cards accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Expired)
    }

    pub fn can_transition_to(&self, next: CardStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, CardStatus::Approved)
                | (Self::Pending, CardStatus::Executed)
                | (Self::Approved, CardStatus::Executed)
                | (Self::Pending, CardStatus::Expired)
                | (Self::Approved, CardStatus::Expired)
        )
    }
}

/// Recipient of a `send_message` suggested action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub target_type: String,
    pub target_id: String,
    pub address: String,
}

/// Planned TaskCard synthesized by the dispatcher for an L1 or L2 intent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardPlan {
    pub intent_key: String,
    pub params: Value,
    pub message: String,
}

/// The concrete operation a preview UI would execute on approval.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum SuggestedAction {
    SendMessage {
        recipients: Vec<Recipient>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        template_code: Option<String>,
    },
    RunAnalysis {
        analysis_type: String,
        params: Value,
    },
    IntentPlan(CardPlan),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCard {
    pub id: TaskCardId,
    pub tenant_id: TenantId,
    pub entity_type: String,
    pub entity_id: String,
    pub task_type: TaskType,
    pub status: CardStatus,
    pub priority: u8,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<SuggestedAction>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskCard {
    /// Whether `expires_at` has passed, honoring the today's-cards override:
    /// a card created today never counts as expired regardless of its nominal
    /// expiry, so same-day work stays visible.
    pub fn is_effectively_expired(&self, now: DateTime<Utc>) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        expires_at <= now && self.created_at.date_naive() != now.date_naive()
    }

    /// Active-list predicate: not yet executed, and either created today or
    /// not past expiry.
    pub fn is_listed_active(&self, now: DateTime<Utc>) -> bool {
        self.status != CardStatus::Executed && !self.is_effectively_expired(now)
    }
}

/// Canonical dedup key: `{tenant}:{trigger}:{entityType}:{entityId}:{window}`.
///
/// Tenant-wide triggers use `global` as the entity segment so one card covers
/// the whole tenant within the window.
pub fn build_dedup_key(
    tenant_id: &TenantId,
    trigger: &str,
    entity_type: &str,
    entity_id: &str,
    window_segment: &str,
) -> String {
    let entity_segment = if entity_type == "tenant" { "global" } else { entity_id };
    format!("{tenant_id}:{trigger}:{entity_type}:{entity_segment}:{window_segment}")
}

/// Active-list ordering: `priority desc, created_at desc, id desc`.
///
/// Display layers truncate this list, so the ordering decides user-visible
/// triage. The created_at/id tiebreaks keep the order deterministic for
/// equal priorities.
pub fn active_order(a: &TaskCard, b: &TaskCard) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| b.created_at.cmp(&a.created_at))
        .then_with(|| b.id.0.cmp(&a.id.0))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    use super::*;

    pub(crate) fn sample_card(id: &str, priority: u8) -> TaskCard {
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 9, 0, 0).unwrap();
        TaskCard {
            id: TaskCardId(id.to_string()),
            tenant_id: TenantId("t1".to_string()),
            entity_type: "member".to_string(),
            entity_id: "m-1".to_string(),
            task_type: TaskType::Absence,
            status: CardStatus::Pending,
            priority,
            title: "Absence follow-up".to_string(),
            description: None,
            dedup_key: None,
            suggested_action: None,
            source: "ai".to_string(),
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn status_transitions_follow_the_state_machine() {
        assert!(CardStatus::Pending.can_transition_to(CardStatus::Approved));
        assert!(CardStatus::Pending.can_transition_to(CardStatus::Executed));
        assert!(CardStatus::Approved.can_transition_to(CardStatus::Executed));
        assert!(CardStatus::Pending.can_transition_to(CardStatus::Expired));
        assert!(CardStatus::Approved.can_transition_to(CardStatus::Expired));

        assert!(!CardStatus::Executed.can_transition_to(CardStatus::Pending));
        assert!(!CardStatus::Executed.can_transition_to(CardStatus::Approved));
        assert!(!CardStatus::Expired.can_transition_to(CardStatus::Executed));
        assert!(!CardStatus::Approved.can_transition_to(CardStatus::Pending));
    }

    #[test]
    fn dedup_key_uses_global_segment_for_tenant_wide_triggers() {
        let tenant = TenantId("t1".to_string());
        let key = build_dedup_key(&tenant, "send_announcement", "tenant", "ignored", "2026-03");
        assert_eq!(key, "t1:send_announcement:tenant:global:2026-03");

        let key = build_dedup_key(&tenant, "notify_guardians_absent", "member", "m-9", "2026-03-05");
        assert_eq!(key, "t1:notify_guardians_absent:member:m-9:2026-03-05");
    }

    #[test]
    fn todays_cards_survive_nominal_expiry() {
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 18, 0, 0).unwrap();
        let mut card = sample_card("c1", 50);
        card.created_at = now - Duration::hours(4);
        card.expires_at = Some(now - Duration::hours(1));
        assert!(!card.is_effectively_expired(now));
        assert!(card.is_listed_active(now));

        card.created_at = now - Duration::days(2);
        assert!(card.is_effectively_expired(now));
        assert!(!card.is_listed_active(now));
    }

    #[test]
    fn executed_cards_are_never_listed_active() {
        let now = Utc::now();
        let mut card = sample_card("c1", 50);
        card.status = CardStatus::Executed;
        assert!(!card.is_listed_active(now));
    }

    #[test]
    fn active_order_ranks_priority_then_recency_then_id() {
        let mut high = sample_card("a", 90);
        let mut low = sample_card("b", 40);
        assert_eq!(active_order(&high, &low), std::cmp::Ordering::Less);

        low.priority = 90;
        high.created_at = low.created_at;
        // Equal priority and timestamp falls back to id, descending.
        assert_eq!(active_order(&low, &high), std::cmp::Ordering::Less);
    }

    #[test]
    fn suggested_action_round_trips_its_tagged_encoding() {
        let action = SuggestedAction::SendMessage {
            recipients: vec![Recipient {
                target_type: "guardian".to_string(),
                target_id: "g-1".to_string(),
                address: "010-0000-0000".to_string(),
            }],
            message: "Your child was absent today.".to_string(),
            template_code: Some("ABS-01".to_string()),
        };

        let encoded = serde_json::to_value(&action).unwrap();
        assert_eq!(encoded["type"], json!("send_message"));
        let decoded: SuggestedAction = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, action);
    }
}
