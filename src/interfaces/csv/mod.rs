pub mod balance_writer;
pub mod submission_reader;
