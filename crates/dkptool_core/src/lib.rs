pub mod accounts;
pub mod assign;
pub mod backend;
pub mod classify;
pub mod config;
pub mod dkp;
pub mod extract;
pub mod fetch;
pub mod html;
pub mod legacy;
pub mod output;
pub mod reference;
pub mod runtime;
pub mod scrape;
pub mod sync;
