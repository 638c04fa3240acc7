use rng_model::{CompileConfig, Compiler, FsResources, HashAlgorithm};
use rng_validator::DocumentDriver;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;

use structopt::StructOpt;

#[derive(Debug, StructOpt)]
enum Cli {
    /// Validate XML documents against a RELAX NG schema
    Validate {
        schema: PathBuf,
        xml: Vec<PathBuf>,
        #[structopt(long)]
        verbose: bool,
        #[structopt(long)]
        timing: bool,
    },
    /// Print the simplified form of a schema
    Simplify {
        schema: PathBuf,
        /// Stop after this simplification step
        #[structopt(long, default_value = "18")]
        to: u8,
        /// Also list the files read, with their digests
        #[structopt(long)]
        manifest: bool,
        /// Digest algorithm for --manifest
        #[structopt(long, default_value = "SHA-256")]
        hash: String,
        #[structopt(long)]
        verbose: bool,
        #[structopt(long)]
        timing: bool,
    },
}

fn main() {
    env_logger::init();
    match Cli::from_args() {
        Cli::Validate {
            schema,
            xml,
            verbose,
            timing,
        } => validate(schema, xml, verbose, timing),
        Cli::Simplify {
            schema,
            to,
            manifest,
            hash,
            verbose,
            timing,
        } => simplify(schema, to, manifest, &hash, verbose, timing),
    }
}

fn schema_url(path: &Path) -> url::Url {
    let absolute = match fs::canonicalize(path) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}: {}", path.display(), e);
            exit(1);
        }
    };
    url::Url::from_file_path(&absolute).expect("canonical path converts to a URL")
}

fn validate(schema: PathBuf, xmls: Vec<PathBuf>, verbose: bool, timing: bool) {
    let config = CompileConfig {
        verbose,
        timing,
        ..CompileConfig::default()
    };
    let compiler = Compiler::with_config(FsResources, config);
    let compiled = match compiler.compile(&schema_url(&schema)) {
        Ok(compiled) => compiled,
        Err(err) => {
            eprintln!("{}: {}", schema.display(), err);
            exit(1);
        }
    };
    for warning in &compiled.warnings {
        eprintln!("warning: {}", warning);
    }

    let mut failed = false;
    for xml in xmls {
        let doc = match fs::read_to_string(&xml) {
            Ok(doc) => doc,
            Err(e) => {
                eprintln!("{}: {}", xml.display(), e);
                exit(1);
            }
        };
        eprintln!("Validating {}", xml.display());
        let mut driver = DocumentDriver::new(&compiled.schema, &doc);
        loop {
            let report = match driver.validate_next() {
                Some(Ok(report)) => report,
                Some(Err(err)) => {
                    eprintln!("{}: {}", xml.display(), err);
                    failed = true;
                    break;
                }
                None => {
                    let residual = driver.finish();
                    if !residual.errors.is_empty() {
                        failed = true;
                        emit(&xml, &doc, &residual);
                    }
                    break;
                }
            };
            if !report.errors.is_empty() {
                failed = true;
                emit(&xml, &doc, &report);
            }
        }
    }
    if failed {
        exit(2);
    }
}

fn emit(xml: &Path, doc: &str, report: &rng_validator::Report) {
    let (map, diagnostics) = rng_validator::diagnostics(
        xml.to_string_lossy().to_string(),
        doc.to_string(),
        report,
    );
    let mut emitter =
        codemap_diagnostic::Emitter::stderr(codemap_diagnostic::ColorConfig::Auto, Some(&map));
    emitter.emit(&diagnostics[..]);
}

fn simplify(schema: PathBuf, to: u8, manifest: bool, hash: &str, verbose: bool, timing: bool) {
    let manifest_hash = match hash.parse::<HashAlgorithm>() {
        Ok(algorithm) => algorithm,
        Err(e) => {
            eprintln!("{}", e);
            exit(1);
        }
    };
    let config = CompileConfig {
        verbose,
        timing,
        simplify_to: to,
        create_manifest: manifest,
        manifest_hash,
        ..CompileConfig::default()
    };
    let compiler = Compiler::with_config(FsResources, config);
    let simplified = match compiler.simplify(&schema_url(&schema)) {
        Ok(simplified) => simplified,
        Err(err) => {
            eprintln!("{}: {}", schema.display(), err);
            exit(1);
        }
    };
    for warning in &simplified.warnings {
        eprintln!("warning: {}", warning);
    }
    print!("{}", simplified.tree.write_xml(simplified.root));
    if manifest {
        for entry in &simplified.manifest {
            println!("{}  {}", entry.hash, entry.file_path);
        }
    }
}
