pub mod language;
pub mod markup;
