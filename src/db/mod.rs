pub mod postgres;

pub use postgres::Store;
