pub mod sheet;
pub mod summary_report;

pub use sheet::{export, SheetOptions, SheetRow, SheetTable, TestKey, TestRow};
pub use summary_report::SuiteReport;
