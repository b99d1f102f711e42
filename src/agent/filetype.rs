use goblin::Hint;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse classification of a staged sample, used to pick static analysis commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Elf,
    Pe,
    Macho,
    Script,
    #[default]
    Unknown,
}

impl FileType {
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.starts_with(b"#!") {
            return FileType::Script;
        }
        if bytes.len() < 4 {
            return FileType::Unknown;
        }

        let mut head = [0u8; 16];
        let n = bytes.len().min(head.len());
        head[..n].copy_from_slice(&bytes[..n]);

        match goblin::peek_bytes(&head) {
            Ok(Hint::Elf(_)) => FileType::Elf,
            Ok(Hint::PE) | Ok(Hint::TE) => FileType::Pe,
            Ok(Hint::Mach(_)) | Ok(Hint::MachFat(_)) => FileType::Macho,
            _ => FileType::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Elf => "elf",
            FileType::Pe => "pe",
            FileType::Macho => "macho",
            FileType::Script => "script",
            FileType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_elf() {
        let mut elf = b"\x7fELF\x02\x01\x01\x00".to_vec();
        elf.resize(64, 0);
        assert_eq!(FileType::detect(&elf), FileType::Elf);
    }

    #[test]
    fn detects_pe() {
        let mut pe = b"MZ\x90\x00\x03\x00\x00\x00".to_vec();
        pe.resize(128, 0);
        assert_eq!(FileType::detect(&pe), FileType::Pe);
    }

    #[test]
    fn detects_macho() {
        // MH_MAGIC_64, little endian
        let mut macho = vec![0xcf, 0xfa, 0xed, 0xfe, 0x07, 0x00, 0x00, 0x01];
        macho.resize(32, 0);
        assert_eq!(FileType::detect(&macho), FileType::Macho);
    }

    #[test]
    fn detects_scripts_by_shebang() {
        assert_eq!(FileType::detect(b"#!/bin/sh\necho hi\n"), FileType::Script);
    }

    #[test]
    fn short_or_plain_data_is_unknown() {
        assert_eq!(FileType::detect(b""), FileType::Unknown);
        assert_eq!(FileType::detect(b"MZ"), FileType::Unknown);
        assert_eq!(
            FileType::detect(b"just some text that is long enough"),
            FileType::Unknown
        );
    }

    #[test]
    fn displays_lowercase_tag() {
        assert_eq!(FileType::Elf.to_string(), "elf");
        assert_eq!(serde_json::to_string(&FileType::Macho).unwrap(), "\"macho\"");
    }
}
