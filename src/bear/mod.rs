pub mod launcher;
pub mod xcallback;
