use std::path::Path;

use loomir::program::ProgramUnit;
use semver::{Comparator, Op, Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::{
    magic,
    utils::error::{WeaveError, WeaveResult},
    wverror, wvtrace,
    wvlog::LogChannel,
};

/// Version of the weaver writing and reading stored programs.
pub fn storage_version() -> WeaveResult<Version> {
    Version::parse(env!("CARGO_PKG_VERSION")).map_err(|e| WeaveError::StorageEncode(e.to_string()))
}

/// A program unit together with the files it was built from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredProgram {
    pub inputs: Vec<String>,
    pub unit: ProgramUnit,
}

impl StoredProgram {
    pub fn new(unit: ProgramUnit) -> Self {
        Self {
            inputs: Vec::new(),
            unit,
        }
    }

    pub fn encode(&self, log: &LogChannel) -> WeaveResult<Vec<u8>> {
        let mut buf = Vec::new();
        let mut serializer = serde_cbor::Serializer::new(&mut buf);
        self.serialize(&mut serializer).map_err(|e| {
            wverror!(log, "Failed to serialize program `{}`: {}", self.unit.name, e);
            WeaveError::StorageEncode(e.to_string())
        })?;

        let version = storage_version()?;
        let storage = ProgramStorage {
            magic: magic::STORAGE_MAGIC_BYTES,
            version_req: VersionReq {
                comparators: vec![Comparator {
                    op: Op::Caret,
                    major: version.major,
                    minor: Some(version.minor),
                    patch: None,
                    pre: version.pre.clone(),
                }],
            },
            data: buf,
        };
        wvtrace!(
            log,
            "Serializing program storage of `{}` with version requirement {}",
            self.unit.name,
            storage.version_req
        );

        let mut buf = Vec::new();
        serde_cbor::to_writer(&mut buf, &storage).map_err(|e| {
            wverror!(log, "Failed to serialize program storage wrapper: {}", e);
            WeaveError::StorageEncode(e.to_string())
        })?;
        Ok(buf)
    }

    pub fn decode(log: &LogChannel, data: &[u8]) -> WeaveResult<Self> {
        wvtrace!(log, "Deserializing program storage ({} bytes)", data.len());

        let storage: ProgramStorage = serde_cbor::from_slice(data).map_err(|e| {
            wverror!(log, "Failed to deserialize program storage wrapper: {}", e);
            WeaveError::StorageDecode(e.to_string())
        })?;

        if storage.magic != magic::STORAGE_MAGIC_BYTES {
            wverror!(log, "Invalid magic bytes in program storage");
            return Err(WeaveError::StorageMagic);
        }

        let version = storage_version()?;
        if !storage.version_req.matches(&version) {
            wverror!(
                log,
                "Incompatible program storage version: required {}, found {}",
                storage.version_req,
                version
            );
            return Err(WeaveError::StorageVersion {
                req: storage.version_req,
                version,
            });
        }

        serde_cbor::from_slice(&storage.data).map_err(|e| {
            wverror!(log, "Failed to deserialize program: {}", e);
            WeaveError::StorageDecode(e.to_string())
        })
    }

    pub fn read_from(path: impl AsRef<Path>, log: &LogChannel) -> WeaveResult<Self> {
        let data = std::fs::read(path)?;
        Self::decode(log, &data)
    }

    pub fn write_to(&self, path: impl AsRef<Path>, log: &LogChannel) -> WeaveResult<()> {
        let data = self.encode(log)?;
        std::fs::write(path, data)?;
        Ok(())
    }
}

/// Envelope of a stored program unit.
///
/// The layout must stay readable by every release: the magic bytes
/// ([`magic::STORAGE_MAGIC_BYTES`]) identify the file, the version
/// requirement is checked against the reading weaver before `data` (the CBOR
/// encoded [`StoredProgram`]) is decoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramStorage {
    pub magic: [u8; 8],
    pub version_req: VersionReq,
    pub data: Vec<u8>,
}
