//! Command implementations

pub mod inspect;
pub mod run;

use error_stack::Report;
use tessera_plugins::ReloadError;

/// Render a reload report, attachments included, as an anyhow error
pub(crate) fn report_error(report: Report<ReloadError>) -> anyhow::Error {
    anyhow::anyhow!("{report:?}")
}
