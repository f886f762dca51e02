//! Board domain model.
//!
//! A board document is five correlated collections: the board itself, the
//! cards on it, links between cards, groups of cards, and the presentation
//! steps that walk through cards or groups. Dependent collections reference
//! their containers by id, so batches and remote folds always process
//! collections in [`RESOURCE_ORDER`].
//!
//! The sync engine treats all of these as opaque JSON records; the typed
//! structs here are the projection/validation layer the concrete repo uses
//! and what the TypeScript UI consumes as generated bindings.

mod repo;

pub use repo::{BoardAdapter, BoardApi, BoardRepo};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Collection name for boards.
pub const BOARDS: &str = "boards";
/// Collection name for cards.
pub const CARDS: &str = "cards";
/// Collection name for links between cards.
pub const LINKS: &str = "links";
/// Collection name for card groups.
pub const GROUPS: &str = "groups";
/// Collection name for presentation steps.
pub const STEPS: &str = "steps";

/// All collections in dependency order: referenced collections first.
pub const RESOURCE_ORDER: [&str; 5] = [BOARDS, CARDS, LINKS, GROUPS, STEPS];

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// A board document.
///
/// Boards are created outside the batch API (by the application shell);
/// through this crate they can only be retitled, themed, or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Board {
    /// Immutable id.
    pub id: String,
    /// Display title.
    pub title: String,
    /// Optional theme name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    /// Server-stamped creation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Server-stamped last-write time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A card on a board.
///
/// Cards are heterogeneous: each kind has its own editable field set, and a
/// card can never change kind once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Card {
    /// A sticky-note card.
    Note {
        /// Immutable id.
        id: String,
        /// Owning board.
        board_id: String,
        /// Canvas x position.
        x: f64,
        /// Canvas y position.
        y: f64,
        /// Note text.
        text: String,
        /// Optional color token.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<String>,
        /// Server-stamped last-write time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_at: Option<DateTime<Utc>>,
    },
    /// An image card.
    Image {
        /// Immutable id.
        id: String,
        /// Owning board.
        board_id: String,
        /// Canvas x position.
        x: f64,
        /// Canvas y position.
        y: f64,
        /// Image URL.
        url: String,
        /// Rendered width.
        width: f64,
        /// Rendered height.
        height: f64,
        /// Server-stamped last-write time.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_at: Option<DateTime<Utc>>,
    },
}

impl Card {
    /// Create a note card with a fresh client-side id.
    pub fn new_note(board_id: impl Into<String>, x: f64, y: f64, text: impl Into<String>) -> Self {
        Card::Note {
            id: new_id(),
            board_id: board_id.into(),
            x,
            y,
            text: text.into(),
            color: None,
            updated_at: None,
        }
    }

    /// Create an image card with a fresh client-side id.
    pub fn new_image(
        board_id: impl Into<String>,
        x: f64,
        y: f64,
        url: impl Into<String>,
        width: f64,
        height: f64,
    ) -> Self {
        Card::Image {
            id: new_id(),
            board_id: board_id.into(),
            x,
            y,
            url: url.into(),
            width,
            height,
            updated_at: None,
        }
    }

    /// The card's id.
    pub fn id(&self) -> &str {
        match self {
            Card::Note { id, .. } | Card::Image { id, .. } => id,
        }
    }

    /// The owning board's id.
    pub fn board_id(&self) -> &str {
        match self {
            Card::Note { board_id, .. } | Card::Image { board_id, .. } => board_id,
        }
    }

    /// The kind discriminant as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Card::Note { .. } => "note",
            Card::Image { .. } => "image",
        }
    }
}

/// A directed link between two cards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct BoardLink {
    /// Immutable id.
    pub id: String,
    /// Owning board.
    pub board_id: String,
    /// Source card id.
    pub from_card: String,
    /// Target card id.
    pub to_card: String,
    /// Optional label rendered on the link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Server-stamped last-write time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl BoardLink {
    /// Create a link with a fresh client-side id.
    pub fn new(
        board_id: impl Into<String>,
        from_card: impl Into<String>,
        to_card: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            board_id: board_id.into(),
            from_card: from_card.into(),
            to_card: to_card.into(),
            label: None,
            updated_at: None,
        }
    }
}

/// A named group of cards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct CardGroup {
    /// Immutable id.
    pub id: String,
    /// Owning board.
    pub board_id: String,
    /// Optional group title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Member cards, in display order.
    pub card_ids: Vec<String>,
    /// Server-stamped last-write time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CardGroup {
    /// Create a group with a fresh client-side id.
    pub fn new(board_id: impl Into<String>, card_ids: Vec<String>) -> Self {
        Self {
            id: new_id(),
            board_id: board_id.into(),
            title: None,
            card_ids,
            updated_at: None,
        }
    }
}

/// What one presentation step focuses on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
#[serde(tag = "target_kind", rename_all = "lowercase")]
pub enum StepTarget {
    /// Focus a single card.
    Card {
        /// The focused card's id.
        card_id: String,
    },
    /// Focus a whole group.
    Group {
        /// The focused group's id.
        group_id: String,
    },
}

/// One step of a board's presentation sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct Step {
    /// Immutable id.
    pub id: String,
    /// Owning board.
    pub board_id: String,
    /// Position in the sequence.
    pub rank: u32,
    /// What the step focuses.
    pub target: StepTarget,
    /// Server-stamped last-write time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Step {
    /// Create a step with a fresh client-side id.
    pub fn new(board_id: impl Into<String>, rank: u32, target: StepTarget) -> Self {
        Self {
            id: new_id(),
            board_id: board_id.into(),
            rank,
            target,
            updated_at: None,
        }
    }
}
