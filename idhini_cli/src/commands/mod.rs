pub mod audit;
pub mod init;
pub mod record;
pub mod user;
