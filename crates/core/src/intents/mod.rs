//! Intent contract registry.
//!
//! Every operation the agent can perform is classified here, once, at process
//! start. The registry is the single source of truth for the automation tier
//! an operation runs at: a handler cannot promote itself to autonomous
//! execution by any means other than a contract change in this catalog.

mod params;

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use params::{ParamField, ParamSchema, ParamType};

use crate::cards::TaskType;
use crate::errors::ToolError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutomationTier {
    /// Read-only, executed immediately within the conversation.
    L0,
    /// Deferred into a TaskCard awaiting human approval.
    L1,
    /// Approval-gated execution of a side effect.
    L2,
}

impl AutomationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::L0 => "L0",
            Self::L1 => "L1",
            Self::L2 => "L2",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "L0" | "l0" => Some(Self::L0),
            "L1" | "l1" => Some(Self::L1),
            "L2" | "l2" => Some(Self::L2),
            _ => None,
        }
    }
}

/// Side-effect class of an L2 intent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionClass {
    /// Notification or outbound send.
    A,
    /// Domain-mutating write.
    B,
}

/// Dedup window granularity for the TaskCard an intent produces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DedupWindow {
    Daily,
    Monthly,
    Hourly,
    Batch,
}

impl DedupWindow {
    /// Renders the window segment of a dedup key for the given instant.
    pub fn segment(&self, now: chrono::DateTime<chrono::Utc>) -> String {
        match self {
            Self::Daily => now.format("%Y-%m-%d").to_string(),
            Self::Monthly => now.format("%Y-%m").to_string(),
            Self::Hourly => now.format("%Y-%m-%dT%H").to_string(),
            Self::Batch => "batch".to_string(),
        }
    }
}

/// TaskCard synthesis metadata carried by card-producing contracts.
#[derive(Clone, Debug)]
pub struct CardSpec {
    pub task_type: TaskType,
    pub trigger: &'static str,
    pub entity_type: &'static str,
    pub window: DedupWindow,
    pub subtype: Option<&'static str>,
}

#[derive(Clone, Debug)]
pub struct IntentContract {
    pub intent_key: &'static str,
    pub description: &'static str,
    pub automation_tier: AutomationTier,
    pub execution_class: Option<ExecutionClass>,
    pub param_schema: ParamSchema,
    /// Automation event required for autonomous L2-A execution.
    pub event_type: Option<&'static str>,
    pub card_spec: Option<CardSpec>,
}

impl IntentContract {
    /// The tier this contract actually runs at.
    ///
    /// Class-B (domain-mutating) intents are always treated as L1 until the
    /// domain-action catalog exists. This is a deliberate fail-closed
    /// downgrade, independent of the declared tier.
    pub fn effective_tier(&self) -> AutomationTier {
        if self.execution_class == Some(ExecutionClass::B) {
            return AutomationTier::L1;
        }
        self.automation_tier
    }
}

/// Registered automation event types.
///
/// Execution of an L2-A intent whose `event_type` is absent from this catalog
/// is refused outright rather than downgraded.
#[derive(Clone, Debug)]
pub struct EventCatalog {
    events: BTreeSet<&'static str>,
}

impl EventCatalog {
    pub fn builtin() -> Self {
        let events = [
            "absence_first_day",
            "announcement_digest",
            "announcement_urgent",
            "class_change_or_cancel",
            "consultation_summary_ready",
            "monthly_business_report",
            "new_member_drop",
            "overdue_outstanding_over_limit",
            "payment_due_reminder",
        ]
        .into_iter()
        .collect();
        Self { events }
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.events.contains(event_type)
    }
}

pub struct IntentRegistry {
    contracts: HashMap<&'static str, IntentContract>,
    events: EventCatalog,
}

impl IntentRegistry {
    pub fn resolve(&self, intent_key: &str) -> Option<&IntentContract> {
        self.contracts.get(intent_key)
    }

    /// Resolves the contract and checks the arguments against its schema.
    pub fn validate(&self, intent_key: &str, args: &Value) -> Result<&IntentContract, ToolError> {
        let contract = self
            .resolve(intent_key)
            .ok_or_else(|| ToolError::HandlerNotFound(intent_key.to_string()))?;
        contract.param_schema.validate(args)?;
        Ok(contract)
    }

    /// Checks that an intent may be executed autonomously right now.
    ///
    /// Re-run at execution time, not only at planning time, so a card approved
    /// before a contract change cannot smuggle a stale authorization through.
    pub fn ensure_executable(&self, intent_key: &str) -> Result<&IntentContract, ToolError> {
        let contract = self
            .resolve(intent_key)
            .ok_or_else(|| ToolError::HandlerNotFound(intent_key.to_string()))?;

        match contract.effective_tier() {
            AutomationTier::L2 => {}
            tier => {
                return Err(ToolError::InputType(format!(
                    "intent `{intent_key}` is tier {} and does not support direct execution",
                    tier.as_str()
                )));
            }
        }

        match contract.event_type {
            Some(event_type) if self.events.contains(event_type) => Ok(contract),
            Some(event_type) => Err(ToolError::EventTypeUnregistered(event_type.to_string())),
            None => Err(ToolError::EventTypeUnregistered(intent_key.to_string())),
        }
    }

    pub fn events(&self) -> &EventCatalog {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.contracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.is_empty()
    }

    pub fn contracts(&self) -> impl Iterator<Item = &IntentContract> {
        self.contracts.values()
    }

    /// The full built-in contract catalog. Built once at startup; immutable.
    pub fn builtin() -> Self {
        let mut contracts = HashMap::new();
        let mut add = |contract: IntentContract| {
            contracts.insert(contract.intent_key, contract);
        };

        // Member lookups.
        add(l0(
            "member.query.search",
            "Find members by name or phone fragment",
            ParamSchema::new()
                .required("query", ParamType::String)
                .optional("limit", ParamType::Integer),
        ));
        add(l0(
            "member.query.profile",
            "Full profile of a single member",
            ParamSchema::new().required("member_id", ParamType::String),
        ));

        // Attendance queries.
        for (subtype, description) in [
            ("late", "Members who arrived late in the period"),
            ("absent", "Members absent in the period"),
            ("early_leave", "Members who left early in the period"),
            ("unchecked", "Sessions with no attendance check recorded"),
        ] {
            add(l0_keyed(
                "attendance.query.",
                subtype,
                description,
                ParamSchema::new()
                    .optional("date", ParamType::String)
                    .optional("class_id", ParamType::String),
            ));
        }
        add(l0(
            "attendance.query.by_member",
            "Attendance history of one member",
            ParamSchema::new()
                .required("member_id", ParamType::String)
                .optional("from", ParamType::String)
                .optional("to", ParamType::String),
        ));
        add(l0(
            "attendance.query.by_class",
            "Attendance roll of one class session",
            ParamSchema::new()
                .required("class_id", ParamType::String)
                .optional("date", ParamType::String),
        ));

        // Billing queries.
        add(l0(
            "billing.query.overdue",
            "Members with overdue balances",
            ParamSchema::new().optional("min_amount", ParamType::Integer),
        ));
        add(l0(
            "billing.query.by_member",
            "Billing ledger of one member",
            ParamSchema::new().required("member_id", ParamType::String),
        ));
        add(l0(
            "billing.query.invoice_status",
            "Status of outstanding invoices",
            ParamSchema::new().optional("month", ParamType::String),
        ));
        add(l0(
            "billing.query.failed_payments",
            "Payment attempts that failed recently",
            ParamSchema::new().optional("from", ParamType::String),
        ));
        add(l0(
            "billing.query.kpi_summary",
            "Revenue and collection KPI snapshot",
            ParamSchema::new().optional("month", ParamType::String),
        ));

        // Class and schedule queries.
        add(l0("class.query.list", "All classes for the tenant", ParamSchema::new()));
        add(l0(
            "class.query.roster",
            "Enrolled members of one class",
            ParamSchema::new().required("class_id", ParamType::String),
        ));
        add(l0("schedule.query.today", "Today's schedule", ParamSchema::new()));
        add(l0(
            "schedule.query.by_staff",
            "Schedule of one staff member",
            ParamSchema::new().required("staff_id", ParamType::String),
        ));
        add(l0(
            "schedule.query.by_class",
            "Upcoming sessions of one class",
            ParamSchema::new().required("class_id", ParamType::String),
        ));

        // Message log queries.
        add(l0(
            "message.query.sent_log",
            "Recently sent messages",
            ParamSchema::new().optional("from", ParamType::String),
        ));
        add(l0(
            "message.query.failed_log",
            "Messages that failed to deliver",
            ParamSchema::new().optional("from", ParamType::String),
        ));

        // Dashboard reports.
        add(l0(
            "report.query.attendance_summary",
            "Attendance KPI summary",
            ParamSchema::new().optional("month", ParamType::String),
        ));
        add(l0(
            "report.query.billing_summary",
            "Billing KPI summary",
            ParamSchema::new().optional("month", ParamType::String),
        ));
        add(l0(
            "report.query.overall_summary",
            "Combined operational KPI summary",
            ParamSchema::new().optional("month", ParamType::String),
        ));

        // AI assist reads.
        add(l0(
            "ai.summarize.member_history",
            "Summarize one member's interaction history",
            ParamSchema::new().required("member_id", ParamType::String),
        ));
        add(l0(
            "ai.summarize.class_history",
            "Summarize one class's recent activity",
            ParamSchema::new().required("class_id", ParamType::String),
        ));
        add(l0(
            "ai.generate.followup_message",
            "Draft a follow-up message for a member",
            ParamSchema::new()
                .required("member_id", ParamType::String)
                .optional("tone", ParamType::String),
        ));
        add(l0(
            "ai.generate.counseling_agenda",
            "Draft a counseling session agenda",
            ParamSchema::new().required("member_id", ParamType::String),
        ));

        // Notification task creation (card-producing).
        for (subtype, task_type, description) in [
            ("late", TaskType::Absence, "Notify guardians about late arrivals"),
            ("absent", TaskType::Absence, "Notify guardians about absences"),
            ("overdue", TaskType::Risk, "Notify guardians about overdue balances"),
            ("general", TaskType::AiSuggested, "Notify guardians with a general notice"),
        ] {
            add(l1(
                leak_key("attendance.create.notify_guardians_", subtype),
                description,
                ParamSchema::new()
                    .optional("member_ids", ParamType::Array)
                    .optional("message", ParamType::String),
                CardSpec {
                    task_type,
                    trigger: leak_key("notify_guardians_", subtype),
                    entity_type: "member",
                    window: DedupWindow::Daily,
                    subtype: Some(subtype),
                },
            ));
        }

        // Message drafts (card-producing).
        for (subtype, task_type, description) in [
            ("absence_notice", TaskType::Absence, "Draft an absence notice"),
            ("overdue_notice", TaskType::Risk, "Draft an overdue-balance notice"),
            ("general_notice", TaskType::AiSuggested, "Draft a general notice"),
            ("payment_link", TaskType::Risk, "Draft a payment link message"),
        ] {
            add(l1(
                leak_key("message.draft.", subtype),
                description,
                ParamSchema::new()
                    .optional("member_id", ParamType::String)
                    .optional("message", ParamType::String),
                CardSpec {
                    task_type,
                    trigger: leak_key("draft_", subtype),
                    entity_type: "member",
                    window: DedupWindow::Daily,
                    subtype: Some(subtype),
                },
            ));
        }

        // Autonomous sends (class A, event-gated).
        add(l2a(
            "message.exec.send_absence_notice",
            "Send the absence notice to guardians",
            ParamSchema::new()
                .required("member_id", ParamType::String)
                .optional("message", ParamType::String),
            "absence_first_day",
            CardSpec {
                task_type: TaskType::Absence,
                trigger: "send_absence_notice",
                entity_type: "member",
                window: DedupWindow::Daily,
                subtype: None,
            },
        ));
        add(l2a(
            "message.exec.send_payment_reminder",
            "Send a payment reminder",
            ParamSchema::new()
                .required("member_id", ParamType::String)
                .optional("message", ParamType::String),
            "payment_due_reminder",
            CardSpec {
                task_type: TaskType::Risk,
                trigger: "send_payment_reminder",
                entity_type: "member",
                window: DedupWindow::Monthly,
                subtype: None,
            },
        ));
        add(l2a(
            "message.exec.send_announcement",
            "Send an announcement to the whole tenant",
            ParamSchema::new().required("message", ParamType::String),
            "announcement_urgent",
            CardSpec {
                task_type: TaskType::AiSuggested,
                trigger: "send_announcement",
                entity_type: "tenant",
                window: DedupWindow::Hourly,
                subtype: None,
            },
        ));
        add(l2a(
            "report.exec.monthly_report",
            "Compile and send the monthly business report",
            ParamSchema::new().optional("month", ParamType::String),
            "monthly_business_report",
            CardSpec {
                task_type: TaskType::AiSuggested,
                trigger: "monthly_report",
                entity_type: "tenant",
                window: DedupWindow::Monthly,
                subtype: None,
            },
        ));

        // Domain-mutating operations (class B, approval-only until the
        // domain-action catalog exists).
        add(l2b(
            "member.exec.register",
            "Register a new member",
            ParamSchema::new()
                .required("name", ParamType::String)
                .optional("phone", ParamType::String),
            CardSpec {
                task_type: TaskType::NewSignup,
                trigger: "register_member",
                entity_type: "tenant",
                window: DedupWindow::Hourly,
                subtype: None,
            },
        ));
        add(l2b(
            "member.exec.discharge",
            "Discharge a member",
            ParamSchema::new().required("member_id", ParamType::String),
            CardSpec {
                task_type: TaskType::Risk,
                trigger: "discharge_member",
                entity_type: "member",
                window: DedupWindow::Daily,
                subtype: None,
            },
        ));
        add(l2b(
            "member.exec.pause",
            "Pause a member's enrollment",
            ParamSchema::new().required("member_id", ParamType::String),
            CardSpec {
                task_type: TaskType::Risk,
                trigger: "pause_member",
                entity_type: "member",
                window: DedupWindow::Daily,
                subtype: None,
            },
        ));

        Self { contracts, events: EventCatalog::builtin() }
    }
}

fn l0(intent_key: &'static str, description: &'static str, schema: ParamSchema) -> IntentContract {
    IntentContract {
        intent_key,
        description,
        automation_tier: AutomationTier::L0,
        execution_class: None,
        param_schema: schema,
        event_type: None,
        card_spec: None,
    }
}

fn l0_keyed(
    prefix: &'static str,
    subtype: &'static str,
    description: &'static str,
    schema: ParamSchema,
) -> IntentContract {
    let intent_key = leak_key(prefix, subtype);
    IntentContract {
        intent_key,
        description,
        automation_tier: AutomationTier::L0,
        execution_class: None,
        param_schema: schema,
        event_type: None,
        card_spec: None,
    }
}

fn l1(
    intent_key: &'static str,
    description: &'static str,
    schema: ParamSchema,
    card_spec: CardSpec,
) -> IntentContract {
    IntentContract {
        intent_key,
        description,
        automation_tier: AutomationTier::L1,
        execution_class: None,
        param_schema: schema,
        event_type: None,
        card_spec: Some(card_spec),
    }
}

fn l2a(
    intent_key: &'static str,
    description: &'static str,
    schema: ParamSchema,
    event_type: &'static str,
    card_spec: CardSpec,
) -> IntentContract {
    IntentContract {
        intent_key,
        description,
        automation_tier: AutomationTier::L2,
        execution_class: Some(ExecutionClass::A),
        param_schema: schema,
        event_type: Some(event_type),
        card_spec: Some(card_spec),
    }
}

fn l2b(
    intent_key: &'static str,
    description: &'static str,
    schema: ParamSchema,
    card_spec: CardSpec,
) -> IntentContract {
    IntentContract {
        intent_key,
        description,
        automation_tier: AutomationTier::L2,
        execution_class: Some(ExecutionClass::B),
        param_schema: schema,
        event_type: None,
        card_spec: Some(card_spec),
    }
}

/// Builds a `'static` dotted key from a prefix and subtype.
///
/// The catalog is constructed exactly once per process, so the handful of
/// leaked strings here are effectively static data.
fn leak_key(prefix: &str, subtype: &str) -> &'static str {
    Box::leak(format!("{prefix}{subtype}").into_boxed_str())
}
