//! Resolution of compiled contract artifacts by name

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use alloy::{
    dyn_abi::{DynSolValue, JsonAbiExt, Specifier},
    json_abi::{ContractObject, Function, JsonAbi},
};
use alloy_primitives::{Bytes, Selector};
use tracing::debug;

use crate::{
    constants::{ARTIFACT_EXTENSION, BUILD_INFO_DIR, DEBUG_ARTIFACT_SUFFIX},
    errors::DeployError,
    types::ContractName,
};

/// Resolves a contract's compiled interface and bytecode by name
pub trait ContractBinder {
    /// Resolve the artifact for `name`, failing with `UnknownContract` if there is none
    fn bind(&self, name: &ContractName) -> Result<Arc<CompiledArtifact>, DeployError>;
}

/// A compiled contract: its ABI and creation bytecode
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledArtifact {
    /// The contract name
    name: ContractName,
    /// The contract ABI
    abi: JsonAbi,
    /// The creation bytecode, without constructor arguments
    bytecode: Bytes,
}

impl CompiledArtifact {
    /// Create an artifact, rejecting contracts that have no creation code
    pub fn new(name: ContractName, abi: JsonAbi, bytecode: Bytes) -> Result<Self, DeployError> {
        if bytecode.is_empty() {
            return Err(DeployError::ArtifactParsing(format!(
                "{} has no bytecode (is it abstract or an interface?)",
                name
            )));
        }

        Ok(Self {
            name,
            abi,
            bytecode,
        })
    }

    /// Parse a Hardhat or solc JSON artifact
    pub fn from_json(name: ContractName, json: &str) -> Result<Self, DeployError> {
        let object: ContractObject = serde_json::from_str(json)
            .map_err(|e| DeployError::ArtifactParsing(format!("{}: {}", name, e)))?;

        let bytecode = object.bytecode.unwrap_or_default();
        Self::new(name, object.abi.unwrap_or_default(), bytecode)
    }

    /// The contract name
    pub fn name(&self) -> &ContractName {
        &self.name
    }

    /// The contract ABI
    pub fn abi(&self) -> &JsonAbi {
        &self.abi
    }

    /// The creation bytecode, without constructor arguments
    pub fn bytecode(&self) -> &Bytes {
        &self.bytecode
    }

    /// The creation code for a deployment: bytecode followed by the ABI-encoded constructor arguments
    pub fn creation_code(&self, args: &[DynSolValue]) -> Result<Bytes, DeployError> {
        let encoded_args = match self.abi.constructor() {
            Some(constructor) => constructor.abi_encode_input(args).map_err(|e| {
                DeployError::CalldataConstruction(format!("{} constructor: {}", self.name, e))
            })?,
            None if args.is_empty() => Vec::new(),
            None => {
                return Err(DeployError::CalldataConstruction(format!(
                    "{} has no constructor but {} arguments were given",
                    self.name,
                    args.len()
                )))
            }
        };

        let mut code = self.bytecode.to_vec();
        code.extend_from_slice(&encoded_args);
        Ok(code.into())
    }

    /// The calldata for calling `function` with `args`
    pub fn calldata(&self, function: &str, args: &[DynSolValue]) -> Result<Bytes, DeployError> {
        let func = self.function(function, args.len())?;
        func.abi_encode_input(args)
            .map(Bytes::from)
            .map_err(|e| {
                DeployError::CalldataConstruction(format!("{}.{}: {}", self.name, function, e))
            })
    }

    /// Parse textual arguments for `function` against its parameter types
    pub fn coerce_args(&self, function: &str, args: &[String]) -> Result<Vec<DynSolValue>, DeployError> {
        let func = self.function(function, args.len())?;
        func.inputs
            .iter()
            .zip(args)
            .map(|(param, arg)| {
                param.resolve().and_then(|ty| ty.coerce_str(arg)).map_err(|e| {
                    DeployError::CalldataConstruction(format!(
                        "{}.{} argument `{}`: {}",
                        self.name, function, param.name, e
                    ))
                })
            })
            .collect()
    }

    /// The selector of `function`, choosing the overload that takes `arity` arguments
    pub fn selector(&self, function: &str, arity: usize) -> Result<Selector, DeployError> {
        self.function(function, arity).map(Function::selector)
    }

    /// Look up a function by name and arity
    fn function(&self, function: &str, arity: usize) -> Result<&Function, DeployError> {
        self.abi
            .function(function)
            .and_then(|overloads| overloads.iter().find(|f| f.inputs.len() == arity))
            .ok_or_else(|| {
                DeployError::CalldataConstruction(format!(
                    "{} has no function `{}` taking {} arguments",
                    self.name, function, arity
                ))
            })
    }
}

/// A binder over a Hardhat `artifacts/` tree, plus any artifacts registered in memory.
///
/// Files are indexed eagerly by name but parsed on first bind; parsed artifacts
/// are cached for the lifetime of the store.
#[derive(Debug, Default)]
pub struct ArtifactStore {
    /// Artifact files by contract name; more than one path means the name is ambiguous
    paths: HashMap<ContractName, Vec<PathBuf>>,
    /// Parsed artifacts
    cache: RwLock<HashMap<ContractName, Arc<CompiledArtifact>>>,
}

impl ArtifactStore {
    /// A store with no artifacts
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every artifact file beneath `dir`
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, DeployError> {
        let mut store = Self::new();
        index_dir(dir.as_ref(), &mut store.paths)?;
        debug!(
            dir = %dir.as_ref().display(),
            count = store.paths.len(),
            "indexed contract artifacts"
        );

        Ok(store)
    }

    /// Register an already-compiled artifact, shadowing any file of the same name
    pub fn with_artifact(self, artifact: CompiledArtifact) -> Self {
        if let Ok(mut cache) = self.cache.write() {
            cache.insert(artifact.name.clone(), Arc::new(artifact));
        }
        self
    }

    /// Whether an artifact with this name is known
    pub fn contains(&self, name: &ContractName) -> bool {
        self.paths.contains_key(name) || self.cached(name).is_some()
    }

    /// Fetch a parsed artifact from the cache
    fn cached(&self, name: &ContractName) -> Option<Arc<CompiledArtifact>> {
        self.cache.read().ok()?.get(name).cloned()
    }
}

impl ContractBinder for ArtifactStore {
    fn bind(&self, name: &ContractName) -> Result<Arc<CompiledArtifact>, DeployError> {
        if let Some(artifact) = self.cached(name) {
            return Ok(artifact);
        }

        let path = match self.paths.get(name).map(Vec::as_slice) {
            None | Some([]) => return Err(DeployError::UnknownContract(name.to_string())),
            Some([path]) => path,
            Some(paths) => {
                return Err(DeployError::ArtifactParsing(format!(
                    "{} is ambiguous, found {} artifacts",
                    name,
                    paths.len()
                )))
            }
        };

        let json = fs::read_to_string(path)
            .map_err(|e| DeployError::ArtifactParsing(format!("{}: {}", path.display(), e)))?;
        let artifact = Arc::new(CompiledArtifact::from_json(name.clone(), &json)?);

        let mut cache = self
            .cache
            .write()
            .map_err(|e| DeployError::ArtifactParsing(e.to_string()))?;
        Ok(cache.entry(name.clone()).or_insert(artifact).clone())
    }
}

/// Recursively collect `<Name>.json` artifact files, skipping debug files and build info
fn index_dir(
    dir: &Path,
    paths: &mut HashMap<ContractName, Vec<PathBuf>>,
) -> Result<(), DeployError> {
    let mut entries = fs::read_dir(dir)
        .map_err(|e| DeployError::ArtifactParsing(format!("{}: {}", dir.display(), e)))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect::<Vec<_>>();
    entries.sort();

    for path in entries {
        if path.is_dir() {
            if path.file_name().is_some_and(|name| name == BUILD_INFO_DIR) {
                continue;
            }
            index_dir(&path, paths)?;
            continue;
        }

        let is_artifact = path.extension().is_some_and(|ext| ext == ARTIFACT_EXTENSION)
            && !path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(DEBUG_ARTIFACT_SUFFIX));
        if !is_artifact {
            continue;
        }

        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            paths.entry(ContractName::new(stem)).or_default().push(path);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{fs, sync::Arc};

    use alloy::{dyn_abi::DynSolValue, json_abi::JsonAbi};
    use alloy_primitives::{Address, Bytes, U256};

    use super::{ArtifactStore, CompiledArtifact, ContractBinder};
    use crate::{errors::DeployError, types::ContractName};

    const CHECKER_ARTIFACT: &str = r#"{
        "_format": "hh-sol-artifact-1",
        "contractName": "Checker",
        "sourceName": "contracts/Checker.sol",
        "abi": [
            {
                "type": "constructor",
                "stateMutability": "nonpayable",
                "inputs": [{ "name": "club", "type": "address", "internalType": "address" }]
            }
        ],
        "bytecode": "0x6080604052",
        "deployedBytecode": "0x6080",
        "linkReferences": {},
        "deployedLinkReferences": {}
    }"#;

    const INTERFACE_ARTIFACT: &str = r#"{
        "_format": "hh-sol-artifact-1",
        "contractName": "IChecker",
        "sourceName": "contracts/IChecker.sol",
        "abi": [],
        "bytecode": "0x",
        "deployedBytecode": "0x",
        "linkReferences": {},
        "deployedLinkReferences": {}
    }"#;

    /// Lay out a Hardhat artifacts tree in a temporary directory
    fn artifacts_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let checker_dir = dir.path().join("contracts").join("Checker.sol");
        fs::create_dir_all(&checker_dir).unwrap();
        fs::write(checker_dir.join("Checker.json"), CHECKER_ARTIFACT).unwrap();
        fs::write(checker_dir.join("Checker.dbg.json"), r#"{"buildInfo": "x"}"#).unwrap();

        let iface_dir = dir.path().join("contracts").join("IChecker.sol");
        fs::create_dir_all(&iface_dir).unwrap();
        fs::write(iface_dir.join("IChecker.json"), INTERFACE_ARTIFACT).unwrap();

        let build_info = dir.path().join("build-info");
        fs::create_dir_all(&build_info).unwrap();
        fs::write(build_info.join("abc123.json"), "{}").unwrap();

        dir
    }

    #[test]
    fn test_bind_from_hardhat_tree() {
        let dir = artifacts_dir();
        let store = ArtifactStore::from_dir(dir.path()).unwrap();

        let artifact = store.bind(&"Checker".into()).unwrap();
        assert_eq!(artifact.name().as_str(), "Checker");
        assert_eq!(artifact.bytecode().as_ref(), &[0x60, 0x80, 0x60, 0x40, 0x52]);
        assert!(artifact.abi().constructor().is_some());

        // Debug files and build info are never indexed
        assert!(!store.contains(&"Checker.dbg".into()));
        assert!(!store.contains(&"abc123".into()));
    }

    #[test]
    fn test_bind_caches_by_name() {
        let dir = artifacts_dir();
        let store = ArtifactStore::from_dir(dir.path()).unwrap();

        let first = store.bind(&"Checker".into()).unwrap();
        fs::remove_dir_all(dir.path().join("contracts")).unwrap();
        let second = store.bind(&"Checker".into()).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_unknown_contract() {
        let dir = artifacts_dir();
        let store = ArtifactStore::from_dir(dir.path()).unwrap();

        let res = store.bind(&ContractName::new("Missing"));
        assert_eq!(
            res.unwrap_err(),
            DeployError::UnknownContract("Missing".to_string())
        );
    }

    #[test]
    fn test_interface_has_no_bytecode() {
        let dir = artifacts_dir();
        let store = ArtifactStore::from_dir(dir.path()).unwrap();

        assert!(matches!(
            store.bind(&"IChecker".into()),
            Err(DeployError::ArtifactParsing(_))
        ));
    }

    #[test]
    fn test_creation_code_appends_constructor_args() {
        let artifact =
            CompiledArtifact::from_json("Checker".into(), CHECKER_ARTIFACT).unwrap();
        let club = Address::repeat_byte(0x11);

        let code = artifact
            .creation_code(&[DynSolValue::Address(club)])
            .unwrap();
        assert_eq!(code.len(), artifact.bytecode().len() + 32);
        assert!(code.starts_with(artifact.bytecode()));
        assert_eq!(&code[code.len() - 20..], club.as_slice());

        // Mistyped or missing arguments are rejected before anything is sent
        assert!(matches!(
            artifact.creation_code(&[DynSolValue::Bool(true)]),
            Err(DeployError::CalldataConstruction(_))
        ));
        assert!(matches!(
            artifact.creation_code(&[]),
            Err(DeployError::CalldataConstruction(_))
        ));
    }

    #[test]
    fn test_calldata_selects_overload_by_arity() {
        let abi = JsonAbi::parse([
            "function initialize(address vault)",
            "function initialize(address checker, address vault)",
        ])
        .unwrap();
        let artifact =
            CompiledArtifact::new("ExchangeCore".into(), abi, Bytes::from_static(&[0x60])).unwrap();

        let one = artifact
            .calldata("initialize", &[DynSolValue::Address(Address::ZERO)])
            .unwrap();
        let two = artifact
            .calldata(
                "initialize",
                &[DynSolValue::Address(Address::ZERO), DynSolValue::Address(Address::ZERO)],
            )
            .unwrap();

        assert_eq!(one.len(), 4 + 32);
        assert_eq!(two.len(), 4 + 64);
        assert_ne!(one[..4], two[..4]);
        assert_eq!(
            &two[..4],
            artifact.selector("initialize", 2).unwrap().as_slice()
        );
        assert!(artifact.calldata("initialize", &[]).is_err());
    }

    #[test]
    fn test_coerce_textual_args() {
        let abi = JsonAbi::parse(["function initializeV2(uint256 fee, address treasury)"]).unwrap();
        let artifact =
            CompiledArtifact::new("ExchangeCoreV2".into(), abi, Bytes::from_static(&[0x60])).unwrap();

        let treasury = Address::repeat_byte(0x22);
        let args = artifact
            .coerce_args("initializeV2", &["30".to_string(), format!("{:#x}", treasury)])
            .unwrap();
        assert_eq!(
            args,
            vec![DynSolValue::Uint(U256::from(30), 256), DynSolValue::Address(treasury)]
        );

        let res = artifact.coerce_args("initializeV2", &["thirty".to_string(), "0x00".to_string()]);
        assert!(matches!(res, Err(DeployError::CalldataConstruction(_))));
    }
}
