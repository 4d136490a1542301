//! Runtime registry (spec §4.1).
//!
//! Descriptors are installed once at construction time in a fixed order and
//! never mutate afterward. Extension-to-runtime resolution is injective
//! except for the documented `.ts` collision, which `Bun` wins because it
//! registers before `Deno`.

use std::collections::HashMap;

use isol8_common::{EngineError, EngineResult, Runtime};

/// How a runtime's `buildCommand` expects to receive code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandForm {
    /// The runtime accepts an inline `-c <code>`-style invocation.
    Inline,
    /// The runtime only runs from a file path; inline execution must be
    /// emulated by writing a temp file first.
    FileOnly,
}

/// An immutable, registry-owned description of one runtime.
#[derive(Debug, Clone)]
pub struct RuntimeDescriptor {
    pub runtime: Runtime,
    pub base_image: &'static str,
    pub file_extension: &'static str,
    pub command_form: CommandForm,
}

impl RuntimeDescriptor {
    /// Build the argv for running `code`, optionally from a staged file at
    /// `file_path` rather than inline.
    ///
    /// Deno has no inline flag: when no file path is given, the returned
    /// command writes `code` to a sandbox temp file via a shell wrapper and
    /// then runs `deno run --allow-all` against it. Callers that already
    /// went through the file-based staging path should always pass
    /// `file_path`.
    pub fn build_command(&self, code: &str, file_path: Option<&str>) -> Vec<String> {
        match self.runtime {
            Runtime::Python => match file_path {
                Some(path) => vec!["python3".into(), path.into()],
                None => vec!["python3".into(), "-c".into(), code.into()],
            },
            Runtime::Node => match file_path {
                Some(path) => vec!["node".into(), path.into()],
                None => vec!["node".into(), "-e".into(), code.into()],
            },
            Runtime::Bun => match file_path {
                Some(path) => vec!["bun".into(), "run".into(), path.into()],
                None => vec!["bun".into(), "-e".into(), code.into()],
            },
            Runtime::Bash => match file_path {
                Some(path) => vec!["bash".into(), path.into()],
                None => vec!["bash".into(), "-c".into(), code.into()],
            },
            Runtime::Deno => match file_path {
                Some(path) => vec!["deno".into(), "run".into(), "--allow-all".into(), path.into()],
                None => {
                    let escaped = code.replace('\'', "'\\''");
                    vec![
                        "sh".into(),
                        "-c".into(),
                        format!(
                            "printf '%s' '{escaped}' > /sandbox/_inline.ts && deno run --allow-all /sandbox/_inline.ts"
                        ),
                    ]
                }
            },
        }
    }

    pub fn supports_inline(&self) -> bool {
        self.command_form == CommandForm::Inline
    }
}

/// Maps runtime names and file extensions to their immutable descriptors.
///
/// Constructed once at engine startup with the built-in registration order
/// (python, node, bun, bash, deno); entries never mutate afterward.
pub struct RuntimeRegistry {
    by_runtime: HashMap<Runtime, RuntimeDescriptor>,
    by_extension: HashMap<&'static str, Runtime>,
    registration_order: Vec<Runtime>,
}

impl RuntimeRegistry {
    /// Install the five built-in descriptors in registration order.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            by_runtime: HashMap::new(),
            by_extension: HashMap::new(),
            registration_order: Vec::new(),
        };
        for runtime in Runtime::REGISTRATION_ORDER {
            registry.register(builtin_descriptor(runtime));
        }
        registry
    }

    /// Register (or overwrite) a descriptor. Extension collisions resolve
    /// last-registered-wins, mirroring the built-in order where `Bun`
    /// (registered before `Deno`) keeps ownership of `.ts`.
    pub fn register(&mut self, descriptor: RuntimeDescriptor) {
        self.by_extension
            .insert(descriptor.file_extension, descriptor.runtime);
        self.registration_order.push(descriptor.runtime);
        self.by_runtime.insert(descriptor.runtime, descriptor);
    }

    pub fn get(&self, runtime: Runtime) -> EngineResult<&RuntimeDescriptor> {
        self.by_runtime
            .get(&runtime)
            .ok_or_else(|| EngineError::UnknownRuntime {
                requested: runtime.as_str().to_string(),
                known: self.list().iter().map(|d| d.runtime.as_str().to_string()).collect(),
            })
    }

    /// Resolve a runtime by its registered name, failing with the set of
    /// names actually installed on this registry (as opposed to
    /// `Runtime::from_str`, which only knows the built-in five).
    pub fn get_by_name(&self, name: &str) -> EngineResult<&RuntimeDescriptor> {
        match name.parse::<Runtime>() {
            Ok(runtime) => self.get(runtime),
            Err(_) => Err(EngineError::UnknownRuntime {
                requested: name.to_string(),
                known: self.list().iter().map(|d| d.runtime.as_str().to_string()).collect(),
            }),
        }
    }

    /// Resolve a runtime by a filename's final extension.
    pub fn detect(&self, filename: &str) -> EngineResult<&RuntimeDescriptor> {
        let extension = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext)
            .unwrap_or(filename);
        let runtime = self
            .by_extension
            .iter()
            .find(|(ext, _)| **ext == extension)
            .map(|(_, runtime)| *runtime)
            .ok_or_else(|| EngineError::UnknownExtension {
                extension: extension.to_string(),
                known: self.by_extension.keys().map(|e| e.to_string()).collect(),
            })?;
        self.get(runtime)
    }

    pub fn list(&self) -> Vec<&RuntimeDescriptor> {
        self.by_runtime.values().collect()
    }
}

fn builtin_descriptor(runtime: Runtime) -> RuntimeDescriptor {
    match runtime {
        Runtime::Python => RuntimeDescriptor {
            runtime,
            base_image: "isol8-python:latest",
            file_extension: "py",
            command_form: CommandForm::Inline,
        },
        Runtime::Node => RuntimeDescriptor {
            runtime,
            base_image: "isol8-node:latest",
            file_extension: "js",
            command_form: CommandForm::Inline,
        },
        Runtime::Bun => RuntimeDescriptor {
            runtime,
            base_image: "isol8-bun:latest",
            file_extension: "ts",
            command_form: CommandForm::Inline,
        },
        Runtime::Bash => RuntimeDescriptor {
            runtime,
            base_image: "isol8-bash:latest",
            file_extension: "sh",
            command_form: CommandForm::Inline,
        },
        Runtime::Deno => RuntimeDescriptor {
            runtime,
            base_image: "isol8-deno:latest",
            file_extension: "deno.ts",
            command_form: CommandForm::FileOnly,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ts_extension_binds_to_bun_not_deno() {
        let registry = RuntimeRegistry::with_builtins();
        let descriptor = registry.detect("solution.ts").expect("known extension");
        assert_eq!(descriptor.runtime, Runtime::Bun);
    }

    #[test]
    fn unknown_extension_lists_known_extensions() {
        let registry = RuntimeRegistry::with_builtins();
        let err = registry.detect("solution.rb").unwrap_err();
        match err {
            EngineError::UnknownExtension { extension, known } => {
                assert_eq!(extension, "rb");
                assert!(known.contains(&"py".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unknown_runtime_lists_known_runtimes() {
        let registry = RuntimeRegistry::with_builtins();
        let err = registry.get_by_name("ruby").unwrap_err();
        match err {
            EngineError::UnknownRuntime { requested, known } => {
                assert_eq!(requested, "ruby");
                assert_eq!(known.len(), 5);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn deno_inline_wraps_in_shell_form() {
        let registry = RuntimeRegistry::with_builtins();
        let descriptor = registry.get(Runtime::Deno).unwrap();
        let argv = descriptor.build_command("console.log(1)", None);
        assert_eq!(argv[0], "sh");
        assert!(argv[2].contains("deno run --allow-all"));
    }
}
