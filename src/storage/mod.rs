pub mod view;
pub mod layout;
pub mod file_lock;
pub mod catalog;
