//! Static analysis command table and the set of files the agent hands back.

use std::path::Path;

use super::filetype::FileType;
use crate::exec::CommandSpec;

/// Harness output of the behavior task.
pub const BEHAVIOR_OUTPUT: &str = "behave.txt";

/// Packet capture written by the network task.
pub const CAPTURE_OUTPUT: &str = "capture.pcap";

/// Every file the agent submits after a session, if present in the staging directory.
pub const ARTIFACTS: &[&str] = &[
    CAPTURE_OUTPUT,
    BEHAVIOR_OUTPUT,
    "yara.txt",
    "objdump.txt",
    "readelf.txt",
    "strings.txt",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applies {
    Any,
    Only(FileType),
}

impl Applies {
    pub fn matches(self, file_type: FileType) -> bool {
        match self {
            Applies::Any => true,
            Applies::Only(wanted) => wanted == file_type,
        }
    }
}

#[derive(Debug)]
pub struct StaticCommand {
    pub name: &'static str,
    pub program: &'static str,
    /// `{sample}` and `{rules}` are substituted at run time.
    pub args: &'static [&'static str],
    pub output: &'static str,
    pub applies: Applies,
}

pub const STATIC_CATALOGUE: &[StaticCommand] = &[
    StaticCommand {
        name: "strings",
        program: "strings",
        args: &["{sample}"],
        output: "strings.txt",
        applies: Applies::Any,
    },
    StaticCommand {
        name: "yara",
        program: "yara",
        args: &["-w", "{rules}", "{sample}"],
        output: "yara.txt",
        applies: Applies::Any,
    },
    StaticCommand {
        name: "objdump",
        program: "objdump",
        args: &["-d", "{sample}"],
        output: "objdump.txt",
        applies: Applies::Only(FileType::Elf),
    },
    StaticCommand {
        name: "readelf",
        program: "readelf",
        args: &["-a", "{sample}"],
        output: "readelf.txt",
        applies: Applies::Only(FileType::Elf),
    },
];

impl StaticCommand {
    pub fn spec(&self, sample: &Path, rules: &str) -> CommandSpec {
        let sample = sample.display().to_string();
        CommandSpec::new(self.program).args(self.args.iter().map(|arg| match *arg {
            "{sample}" => sample.clone(),
            "{rules}" => rules.to_string(),
            other => other.to_string(),
        }))
    }
}

/// Commands that apply to `file_type`, in catalogue order.
pub fn applicable(file_type: FileType) -> impl Iterator<Item = &'static StaticCommand> {
    STATIC_CATALOGUE
        .iter()
        .filter(move |cmd| cmd.applies.matches(file_type))
}
