pub mod export;
pub mod portal;
pub mod serverchan;
pub mod table;
pub mod telegram;
