pub mod crawl;
pub mod health;
pub mod session;
pub mod wechat;
