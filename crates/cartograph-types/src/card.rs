use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `type` field of a Card: classifies the kind of finding it represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardType {
    Review,
    Change,
    Architecture,
    Test,
    Defect,
    Requirement,
}

impl CardType {
    /// The KIND code embedded in a card identifier, e.g. `REV` for `Review`.
    pub fn kind_code(self) -> &'static str {
        match self {
            CardType::Review => "REV",
            CardType::Change => "CHG",
            CardType::Architecture => "ARC",
            CardType::Test => "TST",
            CardType::Defect => "DEF",
            CardType::Requirement => "REQ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    New,
    Queued,
    InAnalysis,
    Proposed,
    InReview,
    Approved,
    Blocked,
    Done,
}

impl CardStatus {
    /// Edges legal for this status per the card state machine. Anything not
    /// listed here is an `IllegalTransition`.
    pub fn legal_next(self) -> &'static [CardStatus] {
        use CardStatus::*;
        match self {
            New => &[Queued, Blocked, Done],
            Queued => &[InAnalysis, Blocked],
            InAnalysis => &[Proposed, Blocked, Done],
            Proposed => &[InReview, InAnalysis],
            InReview => &[Approved, InAnalysis, Blocked],
            Approved => &[Done],
            Blocked => &[Queued, InAnalysis],
            Done => &[],
        }
    }

    pub fn can_transition_to(self, next: CardStatus) -> bool {
        self.legal_next().contains(&next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeReference {
    pub path: String,
    pub line: u32,
    pub col: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposedFix {
    pub file_path: String,
    pub line_range: (u32, u32),
    pub old_text: String,
    pub new_text: String,
    pub validation_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: DateTime<Utc>,
    pub actor: String,
    pub event: String,
    pub diff: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub card_type: CardType,
    pub status: CardStatus,
    pub priority: Priority,
    pub title: String,
    pub summary: String,
    pub owner_agent_id: String,
    pub parent_card_id: Option<String>,
    pub child_card_ids: Vec<String>,
    pub code_refs: Vec<CodeReference>,
    pub test_refs: Vec<String>,
    pub doc_refs: Vec<String>,
    pub risk: f64,
    pub confidence: f64,
    pub coverage_impact: f64,
    pub from_view: Option<String>,
    pub to_view: Option<String>,
    pub proposed_fix: Option<ProposedFix>,
    pub audit_log: Vec<AuditEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    pub fn new(
        id: impl Into<String>,
        card_type: CardType,
        owner_agent_id: impl Into<String>,
        title: impl Into<String>,
        summary: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            card_type,
            status: CardStatus::New,
            priority: Priority::P2,
            title: title.into(),
            summary: summary.into(),
            owner_agent_id: owner_agent_id.into(),
            parent_card_id: None,
            child_card_ids: Vec::new(),
            code_refs: Vec::new(),
            test_refs: Vec::new(),
            doc_refs: Vec::new(),
            risk: 0.0,
            confidence: 0.0,
            coverage_impact: 0.0,
            from_view: None,
            to_view: None,
            proposed_fix: None,
            audit_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_audit(&mut self, actor: impl Into<String>, event: impl Into<String>, diff: Option<String>, ts: DateTime<Utc>) {
        self.audit_log.push(AuditEntry {
            ts,
            actor: actor.into(),
            event: event.into(),
            diff,
        });
        self.updated_at = ts;
    }
}
