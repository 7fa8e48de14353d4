use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cards::{CardStatus, TaskCard};
use crate::identity::{Actor, ActorRole};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CardError {
    #[error("role `{role}` may not {action}")]
    RoleForbidden { role: &'static str, action: &'static str },
    #[error("invalid card transition from {from:?} to {to:?}")]
    InvalidTransition { from: CardStatus, to: CardStatus },
}

impl CardError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoleForbidden { .. } => "ROLE_FORBIDDEN",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::RoleForbidden { .. } => "You are not permitted to perform this action.",
            Self::InvalidTransition { .. } => "This task can no longer be changed.",
        }
    }
}

/// Record of one accepted status transition, consumed by the audit trail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CardTransition {
    pub card_id: super::TaskCardId,
    pub from: CardStatus,
    pub to: CardStatus,
    pub actor_id: String,
    pub actor_role: &'static str,
    pub occurred_at: DateTime<Utc>,
}

/// Outcome of [`CardEngine::complete`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Caller should hard-delete the card row.
    Deleted,
    /// Card updated in place; `transition` is `None` when the call was a
    /// no-op on an already-executed card.
    Updated { card: TaskCard, transition: Option<CardTransition> },
}

/// Pure state machine over TaskCards.
///
/// The engine never touches storage. Each operation takes the current card
/// value and returns the updated card plus a transition record; persistence
/// and audit writes belong to the caller. Role checks run before status
/// checks so an unauthorized caller learns nothing about card state.
#[derive(Clone, Copy, Debug, Default)]
pub struct CardEngine;

impl CardEngine {
    pub fn new() -> Self {
        Self
    }

    /// Teacher-only: `pending -> approved`.
    pub fn request_approval(
        &self,
        card: TaskCard,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<(TaskCard, CardTransition), CardError> {
        if actor.role != ActorRole::Teacher {
            return Err(CardError::RoleForbidden {
                role: actor.role.as_str(),
                action: "request approval",
            });
        }
        self.transition(card, CardStatus::Approved, actor, now)
    }

    /// Admin/owner: `pending|approved -> executed`.
    pub fn approve_and_execute(
        &self,
        card: TaskCard,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<(TaskCard, CardTransition), CardError> {
        if !actor.role.is_privileged() {
            return Err(CardError::RoleForbidden {
                role: actor.role.as_str(),
                action: "approve and execute",
            });
        }
        self.transition(card, CardStatus::Executed, actor, now)
    }

    /// Marks work done. The soft path (`delete_immediately = false`) is the
    /// default so completed work stays auditable; repeating it on an executed
    /// card is a no-op rather than a second transition.
    pub fn complete(
        &self,
        card: TaskCard,
        actor: &Actor,
        delete_immediately: bool,
        now: DateTime<Utc>,
    ) -> Result<Completion, CardError> {
        if delete_immediately {
            return Ok(Completion::Deleted);
        }
        if card.status == CardStatus::Executed {
            return Ok(Completion::Updated { card, transition: None });
        }
        let (card, transition) = self.transition(card, CardStatus::Executed, actor, now)?;
        Ok(Completion::Updated { card, transition: Some(transition) })
    }

    /// Time-based `pending|approved -> expired`, driven by the effective
    /// expiry rule (today's cards never expire early).
    pub fn mark_expired(
        &self,
        card: TaskCard,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<(TaskCard, CardTransition), CardError> {
        if !card.is_effectively_expired(now) {
            return Err(CardError::InvalidTransition {
                from: card.status,
                to: CardStatus::Expired,
            });
        }
        self.transition(card, CardStatus::Expired, actor, now)
    }

    fn transition(
        &self,
        mut card: TaskCard,
        to: CardStatus,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<(TaskCard, CardTransition), CardError> {
        let from = card.status;
        if !from.can_transition_to(to) {
            return Err(CardError::InvalidTransition { from, to });
        }
        card.status = to;
        card.updated_at = now;
        let transition = CardTransition {
            card_id: card.id.clone(),
            from,
            to,
            actor_id: actor.user_id.0.clone(),
            actor_role: actor.role.as_str(),
            occurred_at: now,
        };
        Ok((card, transition))
    }
}
