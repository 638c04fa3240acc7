//! Schema compilation: simplification, restriction checking, and the
//! pattern tree the validator walks.
//!
//! The entry point is [`Compiler`], which pairs a [`Resources`] loader with
//! a [`CompileConfig`] and turns a schema URL into either the simplified
//! element tree ([`Compiler::simplify`]) or a compiled [`Schema`]
//! ([`Compiler::compile`]).

pub mod datatype;
pub mod name_class;
pub mod pattern;
pub mod restrict;
pub mod simplify;

pub use name_class::{ExpandedName, NameClass};
pub use pattern::{Define, DefineId, PatId, Pattern, Schema};

use rng_syntax::tree::{NodeId, Tree};
use rng_syntax::SyntaxError;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::fs;
use std::str::FromStr;
use url::Url;

/// Fatal schema-processing failures. Document-validation errors live in the
/// validator crate and are non-fatal.
#[derive(Debug)]
pub enum SchemaError {
    /// The loader could not produce the referenced resource.
    ResourceLoad { url: String, detail: String },
    Syntax(SyntaxError),
    BadUrl { url: String, detail: String },
    IncludeCycle { url: String },
    IncludedNotAGrammar { url: String },
    MissingHref { path: String },
    /// An `include` override named a `start`/`define` the target lacks.
    OverrideMissing { path: String, name: Option<String> },
    MalformedQName { path: String, name: String },
    Datatype(datatype::DatatypeError),
    DuplicateDefinition { path: String, name: String },
    CombineConflict { path: String, name: String },
    MissingStart { path: String },
    RefError { path: String, name: String },
    /// Structural problems the grammar cannot express (wrong child counts,
    /// unexpected elements).
    InvalidSchema { path: String, detail: String },
    /// Section 7.1 forbidden-path violations.
    ProhibitedPath {
        path: String,
        context: &'static str,
        element: String,
    },
    /// Two attribute name classes in the same group/interleave intersect.
    AttributeNameClash { path: String },
    /// An attribute with an infinite name class outside `oneOrMore`.
    UnboundedAttributeName { path: String },
    InterleaveTextClash { path: String },
    InterleaveElementClash { path: String },
    /// Section 7.2: a pattern has no content type.
    StringValueConstraint { path: String },
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaError::ResourceLoad { url, detail } => {
                write!(f, "failed to load {}: {}", url, detail)
            }
            SchemaError::Syntax(e) => e.fmt(f),
            SchemaError::BadUrl { url, detail } => write!(f, "bad URL {:?}: {}", url, detail),
            SchemaError::IncludeCycle { url } => {
                write!(f, "inclusion cycle through {}", url)
            }
            SchemaError::IncludedNotAGrammar { url } => {
                write!(f, "included file {} is not a grammar", url)
            }
            SchemaError::MissingHref { path } => write!(f, "missing href attribute at {}", path),
            SchemaError::OverrideMissing { path, name } => match name {
                Some(name) => write!(
                    f,
                    "include at {} overrides define {:?} which the target does not declare",
                    path, name
                ),
                None => write!(
                    f,
                    "include at {} overrides start which the target does not declare",
                    path
                ),
            },
            SchemaError::MalformedQName { path, name } => {
                write!(f, "malformed qualified name {:?} at {}", name, path)
            }
            SchemaError::Datatype(e) => e.fmt(f),
            SchemaError::DuplicateDefinition { path, name } => {
                write!(f, "duplicate definition of {:?} at {}", name, path)
            }
            SchemaError::CombineConflict { path, name } => {
                write!(f, "conflicting combine for {:?} at {}", name, path)
            }
            SchemaError::MissingStart { path } => write!(f, "grammar at {} has no start", path),
            SchemaError::RefError { path, name } => {
                write!(f, "ref to undefined pattern {:?} at {}", name, path)
            }
            SchemaError::InvalidSchema { path, detail } => {
                write!(f, "invalid schema at {}: {}", path, detail)
            }
            SchemaError::ProhibitedPath {
                path,
                context,
                element,
            } => write!(f, "prohibited path {}//{} at {}", context, element, path),
            SchemaError::AttributeNameClash { path } => {
                write!(f, "attribute name classes clash at {}", path)
            }
            SchemaError::UnboundedAttributeName { path } => write!(
                f,
                "attribute with wildcard name class outside oneOrMore at {}",
                path
            ),
            SchemaError::InterleaveTextClash { path } => {
                write!(f, "both interleave branches match text at {}", path)
            }
            SchemaError::InterleaveElementClash { path } => {
                write!(f, "interleave branches share element names at {}", path)
            }
            SchemaError::StringValueConstraint { path } => {
                write!(f, "pattern at {} has no content type", path)
            }
        }
    }
}

impl std::error::Error for SchemaError {}

impl From<SyntaxError> for SchemaError {
    fn from(e: SyntaxError) -> SchemaError {
        SchemaError::Syntax(e)
    }
}

impl From<datatype::DatatypeError> for SchemaError {
    fn from(e: datatype::DatatypeError) -> SchemaError {
        SchemaError::Datatype(e)
    }
}

/// A loaded schema file.
pub struct Resource {
    url: Url,
    text: String,
}

impl Resource {
    pub fn new(url: Url, text: String) -> Resource {
        Resource { url, text }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn bytes(&self) -> &[u8] {
        self.text.as_bytes()
    }
}

/// Resource loading, the pipeline's only external collaborator. The core is
/// synchronous; callers with asynchronous sources stage the bytes and hand
/// the pipeline a map-backed implementation.
pub trait Resources {
    fn load(&self, url: &Url) -> Result<Resource, SchemaError>;
}

/// Loads `file:` URLs from the local filesystem.
pub struct FsResources;

impl Resources for FsResources {
    fn load(&self, url: &Url) -> Result<Resource, SchemaError> {
        if url.scheme() != "file" {
            return Err(SchemaError::ResourceLoad {
                url: url.to_string(),
                detail: format!("unsupported URL scheme {:?}", url.scheme()),
            });
        }
        let path = url.to_file_path().map_err(|()| SchemaError::ResourceLoad {
            url: url.to_string(),
            detail: "not a local file path".to_string(),
        })?;
        let text = fs::read_to_string(&path).map_err(|e| SchemaError::ResourceLoad {
            url: url.to_string(),
            detail: e.to_string(),
        })?;
        Ok(Resource::new(url.clone(), text))
    }
}

/// How manifest digests are produced.
pub enum HashAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
    /// Caller-supplied digest over the whole resource.
    Custom(Box<dyn Fn(&Resource) -> String>),
}

impl HashAlgorithm {
    pub fn digest(&self, resource: &Resource) -> String {
        match self {
            HashAlgorithm::Sha1 => {
                format!("SHA-1-{}", hex::encode(Sha1::digest(resource.bytes())))
            }
            HashAlgorithm::Sha256 => {
                format!("SHA-256-{}", hex::encode(Sha256::digest(resource.bytes())))
            }
            HashAlgorithm::Sha384 => {
                format!("SHA-384-{}", hex::encode(Sha384::digest(resource.bytes())))
            }
            HashAlgorithm::Sha512 => {
                format!("SHA-512-{}", hex::encode(Sha512::digest(resource.bytes())))
            }
            HashAlgorithm::Custom(f) => f(resource),
        }
    }
}

impl fmt::Debug for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha384 => "SHA-384",
            HashAlgorithm::Sha512 => "SHA-512",
            HashAlgorithm::Custom(_) => "custom",
        };
        f.write_str(name)
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<HashAlgorithm, String> {
        match s.to_ascii_uppercase().replace('_', "-").as_str() {
            "SHA-1" | "SHA1" => Ok(HashAlgorithm::Sha1),
            "SHA-256" | "SHA256" => Ok(HashAlgorithm::Sha256),
            "SHA-384" | "SHA384" => Ok(HashAlgorithm::Sha384),
            "SHA-512" | "SHA512" => Ok(HashAlgorithm::Sha512),
            other => Err(format!("unknown digest algorithm {:?}", other)),
        }
    }
}

/// One file consumed during simplification, in read order.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ManifestEntry {
    /// Full URL of the file.
    pub file_path: String,
    /// `<algo>-<lowercase hex>` digest of the file's bytes.
    pub hash: String,
}

pub struct CompileConfig {
    /// Print step progress to stderr.
    pub verbose: bool,
    /// Print per-step milliseconds to stderr.
    pub timing: bool,
    /// Keep a serialized snapshot of the tree after each step.
    pub keep_temp: bool,
    /// Stop after this numbered step (1, 4, 6, 9, 10, 14, 15, 16, 17, 18).
    pub simplify_to: u8,
    /// Run the restriction checker after step 18.
    pub validate: bool,
    pub create_manifest: bool,
    pub manifest_hash: HashAlgorithm,
}

impl Default for CompileConfig {
    fn default() -> CompileConfig {
        CompileConfig {
            verbose: false,
            timing: false,
            keep_temp: false,
            simplify_to: 18,
            validate: true,
            create_manifest: false,
            manifest_hash: HashAlgorithm::Sha256,
        }
    }
}

/// Output of the simplification pipeline.
pub struct Simplified {
    pub tree: Tree,
    pub root: NodeId,
    pub warnings: Vec<String>,
    pub manifest: Vec<ManifestEntry>,
    /// `(step, serialized tree)` snapshots, present when `keep_temp` is set.
    pub intermediates: Vec<(u8, String)>,
}

/// A fully compiled schema plus the byproducts of getting there.
pub struct Compiled {
    pub schema: Schema,
    pub warnings: Vec<String>,
    pub manifest: Vec<ManifestEntry>,
}

pub struct Compiler<R: Resources> {
    resources: R,
    config: CompileConfig,
}

impl<R: Resources> Compiler<R> {
    pub fn new(resources: R) -> Compiler<R> {
        Compiler {
            resources,
            config: CompileConfig::default(),
        }
    }

    pub fn with_config(resources: R, config: CompileConfig) -> Compiler<R> {
        Compiler { resources, config }
    }

    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    /// Run the simplification pipeline up to the configured stop point.
    pub fn simplify(&self, url: &Url) -> Result<Simplified, SchemaError> {
        simplify::run(&self.resources, &self.config, url, self.config.simplify_to)
    }

    /// Simplify fully (regardless of `simplify_to`) and build the pattern
    /// tree.
    pub fn compile(&self, url: &Url) -> Result<Compiled, SchemaError> {
        let simplified = simplify::run(&self.resources, &self.config, url, 18)?;
        let schema = Schema::compile(&simplified.tree, simplified.root)?;
        Ok(Compiled {
            schema,
            warnings: simplified.warnings,
            manifest: simplified.manifest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_names_and_padding() {
        let url = Url::parse("file:///x.rng").unwrap();
        let resource = Resource::new(url, "abc".to_string());
        let digest = HashAlgorithm::Sha256.digest(&resource);
        assert_eq!(
            digest,
            "SHA-256-ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let digest = HashAlgorithm::Sha1.digest(&resource);
        assert_eq!(digest, "SHA-1-a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn algorithm_parsing() {
        assert!(matches!(
            "sha-384".parse::<HashAlgorithm>(),
            Ok(HashAlgorithm::Sha384)
        ));
        assert!(matches!(
            "SHA512".parse::<HashAlgorithm>(),
            Ok(HashAlgorithm::Sha512)
        ));
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }
}
