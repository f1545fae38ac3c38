//! SeaORM entity models
//!
//! Database entities for PaperIntake

mod log_entry;
mod paper;
mod section;

pub use paper::{
    Entity as PaperEntity,
    Model as Paper,
    ActiveModel as PaperActiveModel,
    Column as PaperColumn,
};

pub use section::{
    Entity as SectionEntity,
    Model as Section,
    ActiveModel as SectionActiveModel,
    Column as SectionColumn,
};

pub use log_entry::{
    Entity as LogEntryEntity,
    Model as LogEntry,
    ActiveModel as LogEntryActiveModel,
    Column as LogEntryColumn,
};
