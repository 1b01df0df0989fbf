//! Separation engine command line.

use std::path::Path;

use tokio::process::Command;

use crate::config::ServiceConfig;
use crate::jobs::EngineSettings;

/// Program and argument template of the separation engine.
///
/// Template tokens are substituted per job:
///
/// | Token      | Value                                  |
/// |------------|----------------------------------------|
/// | `{model}`  | model identifier from the job settings |
/// | `{output}` | the job's output root                  |
/// | `{input}`  | the input audio file                   |
/// | `{name}`   | input file name without extension      |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    program: String,
    args: Vec<String>,
}

impl EngineCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Engine command configured in `config`.
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.engine_program.clone(), config.engine_args.clone())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Substituted argument list for one run.
    pub fn render_args(&self, settings: &EngineSettings, input: &Path, output: &Path) -> Vec<String> {
        let input_str = input.to_string_lossy();
        let output_str = output.to_string_lossy();
        let name = input
            .file_stem()
            .map(|s| s.to_string_lossy())
            .unwrap_or_default();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{model}", &settings.model)
                    .replace("{output}", &output_str)
                    .replace("{input}", &input_str)
                    .replace("{name}", &name)
            })
            .collect()
    }

    /// Builds the process command for one run.
    pub fn build(&self, settings: &EngineSettings, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(settings, input, output));
        cmd
    }
}
