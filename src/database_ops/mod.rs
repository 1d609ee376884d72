pub mod db;
pub mod ledger;
pub mod steam;
