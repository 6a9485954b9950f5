pub mod genealogy;

pub use genealogy::{GenealogyView, forward_trail, genealogy_of};
