use std::{
    collections::HashMap,
    ffi::OsString,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use crate::core::{domain::Language, errors::UnsupportedLanguage};

const SOURCE: &str = "{source}";
const ARTIFACT: &str = "{artifact}";
const DIR: &str = "{dir}";

/// Command templates of a two-phase language: compile, then run the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRunner {
    pub language: Language,
    pub source_file: &'static str,
    pub artifact_file: &'static str,
    compile: &'static [&'static str],
    run: &'static [&'static str],
    env: &'static [(&'static str, &'static str)],
}

/// Command template of a single-phase language that runs the source directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpretedRunner {
    pub language: Language,
    pub source_file: &'static str,
    run: &'static [&'static str],
    env: &'static [(&'static str, &'static str)],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runner {
    Compiled(CompiledRunner),
    Interpreted(InterpretedRunner),
}

impl Runner {
    pub fn language(&self) -> Language {
        match self {
            Runner::Compiled(runner) => runner.language,
            Runner::Interpreted(runner) => runner.language,
        }
    }

    pub fn source_file(&self) -> &'static str {
        match self {
            Runner::Compiled(runner) => runner.source_file,
            Runner::Interpreted(runner) => runner.source_file,
        }
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self, Runner::Compiled(_))
    }

    /// Where the runnable artifact lives for a given source path.
    pub fn artifact_path(&self, source_path: &Path) -> PathBuf {
        match self {
            Runner::Compiled(runner) => source_path.with_file_name(runner.artifact_file),
            Runner::Interpreted(_) => source_path.to_path_buf(),
        }
    }

    /// `None` for interpreted languages.
    pub fn compile_command(&self, source_path: &Path) -> Option<Vec<OsString>> {
        match self {
            Runner::Compiled(runner) => {
                let artifact_path = self.artifact_path(source_path);
                Some(expand(runner.compile, source_path, &artifact_path))
            }
            Runner::Interpreted(_) => None,
        }
    }

    pub fn run_command(&self, artifact_path: &Path) -> Vec<OsString> {
        match self {
            Runner::Compiled(runner) => expand(runner.run, artifact_path, artifact_path),
            Runner::Interpreted(runner) => expand(runner.run, artifact_path, artifact_path),
        }
    }

    /// Extra environment for both phases, expanded against the working directory.
    pub fn env(&self, workdir: &Path) -> Vec<(String, OsString)> {
        let env = match self {
            Runner::Compiled(runner) => runner.env,
            Runner::Interpreted(runner) => runner.env,
        };
        env.iter()
            .map(|(key, value)| (key.to_string(), substitute(value, workdir, workdir, workdir)))
            .collect()
    }
}

fn expand(template: &[&str], source: &Path, artifact: &Path) -> Vec<OsString> {
    let dir = artifact.parent().unwrap_or_else(|| Path::new("."));
    template
        .iter()
        .map(|arg| substitute(arg, source, artifact, dir))
        .collect()
}

fn substitute(arg: &str, source: &Path, artifact: &Path, dir: &Path) -> OsString {
    match arg {
        SOURCE => source.as_os_str().to_owned(),
        ARTIFACT => artifact.as_os_str().to_owned(),
        DIR => dir.as_os_str().to_owned(),
        _ if arg.contains(DIR) => arg.replace(DIR, &dir.to_string_lossy()).into(),
        _ => arg.into(),
    }
}

static BUILTIN: LazyLock<RunnerRegistry> =
    LazyLock::new(|| RunnerRegistry::with_languages(&Language::ALL));

/// Immutable language → runner mapping. Built once, shared read-only.
#[derive(Debug, Clone)]
pub struct RunnerRegistry {
    runners: HashMap<Language, Runner>,
}

impl RunnerRegistry {
    /// Registry with every supported language enabled.
    pub fn builtin() -> &'static RunnerRegistry {
        &BUILTIN
    }

    pub fn with_languages(languages: &[Language]) -> Self {
        let runners = languages
            .iter()
            .map(|language| (*language, builtin_runner(*language)))
            .collect();
        Self { runners }
    }

    pub fn resolve(&self, language: Language) -> Result<&Runner, UnsupportedLanguage> {
        self.runners
            .get(&language)
            .ok_or_else(|| UnsupportedLanguage::from(language))
    }

    pub fn resolve_name(&self, name: &str) -> Result<&Runner, UnsupportedLanguage> {
        self.resolve(name.parse()?)
    }

    pub fn languages(&self) -> impl Iterator<Item = Language> + '_ {
        self.runners.keys().copied()
    }
}

fn builtin_runner(language: Language) -> Runner {
    match language {
        Language::C => Runner::Compiled(CompiledRunner {
            language,
            source_file: "main.c",
            artifact_file: "main",
            compile: &["gcc", "-O2", "-std=c11", "-o", ARTIFACT, SOURCE, "-lm"],
            run: &[ARTIFACT],
            env: &[],
        }),
        Language::Cpp => Runner::Compiled(CompiledRunner {
            language,
            source_file: "main.cpp",
            artifact_file: "main",
            compile: &["g++", "-O2", "-std=c++17", "-o", ARTIFACT, SOURCE],
            run: &[ARTIFACT],
            env: &[],
        }),
        Language::Rust => Runner::Compiled(CompiledRunner {
            language,
            source_file: "main.rs",
            artifact_file: "main",
            compile: &["rustc", "-O", "--edition", "2021", "-o", ARTIFACT, SOURCE],
            run: &[ARTIFACT],
            env: &[],
        }),
        Language::Go => Runner::Compiled(CompiledRunner {
            language,
            source_file: "main.go",
            artifact_file: "main",
            compile: &["go", "build", "-o", ARTIFACT, SOURCE],
            run: &[ARTIFACT],
            env: &[("GOCACHE", "{dir}/.gocache"), ("GOPATH", "{dir}/.gopath")],
        }),
        Language::Java => Runner::Compiled(CompiledRunner {
            language,
            source_file: "Main.java",
            artifact_file: "Main.class",
            compile: &["javac", "-d", DIR, SOURCE],
            run: &["java", "-Xss64m", "-cp", DIR, "Main"],
            env: &[],
        }),
        Language::Python => Runner::Interpreted(InterpretedRunner {
            language,
            source_file: "main.py",
            run: &["python3", "-B", SOURCE],
            env: &[],
        }),
        Language::JavaScript => Runner::Interpreted(InterpretedRunner {
            language,
            source_file: "main.js",
            run: &["node", SOURCE],
            env: &[],
        }),
        Language::Shell => Runner::Interpreted(InterpretedRunner {
            language,
            source_file: "main.sh",
            run: &["/bin/sh", SOURCE],
            env: &[],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compiled_runner_commands() {
        let runner = RunnerRegistry::builtin().resolve(Language::Cpp).unwrap();
        let source = Path::new("/sandbox/abc/main.cpp");

        assert!(runner.is_compiled());
        assert_eq!(runner.artifact_path(source), Path::new("/sandbox/abc/main"));

        let compile = runner.compile_command(source).unwrap();
        assert_eq!(compile[0], "g++");
        assert!(compile.contains(&OsString::from("/sandbox/abc/main.cpp")));
        assert!(compile.contains(&OsString::from("/sandbox/abc/main")));

        let run = runner.run_command(&runner.artifact_path(source));
        assert_eq!(run, vec![OsString::from("/sandbox/abc/main")]);
    }

    #[test]
    fn test_interpreted_runner_has_no_compile_step() {
        let runner = RunnerRegistry::builtin().resolve(Language::Python).unwrap();
        let source = Path::new("/sandbox/abc/main.py");

        assert!(!runner.is_compiled());
        assert!(runner.compile_command(source).is_none());
        assert_eq!(runner.artifact_path(source), source);
        assert_eq!(
            runner.run_command(source),
            vec![
                OsString::from("python3"),
                OsString::from("-B"),
                OsString::from("/sandbox/abc/main.py")
            ]
        );
    }

    #[test]
    fn test_java_runs_from_class_directory() {
        let runner = RunnerRegistry::builtin().resolve(Language::Java).unwrap();
        let source = Path::new("/sandbox/abc/Main.java");

        let compile = runner.compile_command(source).unwrap();
        assert_eq!(compile[2], "/sandbox/abc");

        let run = runner.run_command(&runner.artifact_path(source));
        assert!(run.contains(&OsString::from("/sandbox/abc")));
        assert_eq!(run.last().unwrap(), "Main");
    }

    #[test]
    fn test_env_expands_working_directory() {
        let runner = RunnerRegistry::builtin().resolve(Language::Go).unwrap();
        let env = runner.env(Path::new("/sandbox/abc"));
        assert!(env.contains(&(
            "GOCACHE".to_string(),
            OsString::from("/sandbox/abc/.gocache")
        )));
    }

    #[test]
    fn test_disabled_language_is_unsupported() {
        let registry = RunnerRegistry::with_languages(&[Language::Shell]);

        assert!(registry.resolve(Language::Shell).is_ok());
        assert_eq!(
            registry.resolve(Language::Cpp),
            Err(UnsupportedLanguage("cpp".to_string()))
        );
        assert!(registry.resolve_name("brainfuck").is_err());
        assert_eq!(registry.languages().count(), 1);
    }
}
