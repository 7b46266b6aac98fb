pub mod ledger_entry;
pub mod order;
pub mod payment;
pub mod product;
pub mod user;
pub mod voucher;
pub mod voucher_category;
