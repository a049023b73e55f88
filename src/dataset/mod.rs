pub mod organizer;

pub use organizer::{train_split_len, ClassReport, DatasetOrganizer, FileReport, PreparationReport, Split};
