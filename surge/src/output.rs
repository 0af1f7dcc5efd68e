use crate::cli::OutputFormat;
use crate::plan_yaml::Target;
use std::path::Path;

mod human;
mod json;

pub(crate) trait OutputFormatter: Send + Sync {
    fn print_header(&self, plan_path: &Path, plan: &surge_core::RunPlan, target: &Target);
    fn progress(&self) -> Option<surge_core::ProgressFn>;
    fn print_summary(&self, summary: &surge_core::Summary) -> anyhow::Result<()>;
}

pub(crate) fn formatter(format: OutputFormat) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::HumanReadable => Box::new(human::HumanReadableOutput::new()),
        OutputFormat::Json => Box::new(json::JsonOutput),
    }
}
