use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use berth_types::{BerthError, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::tool::{parse_args, to_output, Tool, ToolContext, ToolDefinition};

/// File written into the workspace by `analyze_repository` and read back by
/// later stages.
pub const ANALYSIS_FILE: &str = "analysis.json";

const SKIP_PATTERNS: &[&str] = &[
    "**/.git",
    "**/.hg",
    "**/.svn",
    "**/node_modules",
    "**/vendor",
    "**/target",
    "**/dist",
    "**/build",
    "**/__pycache__",
    "**/.venv",
    "**/venv",
];

/// Marker files checked in order; the first present one decides the language.
const MARKERS: &[(&str, &str, &str)] = &[
    ("package.json", "javascript", "npm"),
    ("go.mod", "go", "go"),
    ("requirements.txt", "python", "pip"),
    ("Pipfile", "python", "pipenv"),
    ("pyproject.toml", "python", "pip"),
    ("pom.xml", "java", "maven"),
    ("build.gradle", "java", "gradle"),
    ("build.gradle.kts", "java", "gradle"),
    ("Cargo.toml", "rust", "cargo"),
    ("composer.json", "php", "composer"),
    ("Gemfile", "ruby", "bundler"),
];

const EXTENSIONS: &[(&str, &str)] = &[
    ("js", "javascript"),
    ("ts", "typescript"),
    ("py", "python"),
    ("go", "go"),
    ("java", "java"),
    ("rs", "rust"),
    ("php", "php"),
    ("rb", "ruby"),
    ("cs", "csharp"),
    ("kt", "kotlin"),
];

const ENTRY_POINTS: &[(&str, &[&str])] = &[
    ("javascript", &["index.js", "app.js", "server.js", "main.js"]),
    ("typescript", &["index.ts", "app.ts", "server.ts", "main.ts"]),
    ("python", &["main.py", "app.py", "server.py", "__main__.py", "run.py"]),
    ("go", &["main.go", "cmd/main.go"]),
    ("rust", &["src/main.rs"]),
    ("java", &["src/main/java"]),
];

const PORT_FILES: &[&str] = &[
    ".env",
    ".env.example",
    "config.json",
    "index.js",
    "app.js",
    "server.js",
    "main.py",
    "app.py",
    "main.go",
];

/// What `analyze_repository` learned about a source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryAnalysis {
    pub repo_path: PathBuf,
    pub app_name: String,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default)]
    pub entry_points: Vec<String>,
    pub file_count: usize,
}

impl RepositoryAnalysis {
    /// Load the analysis a previous stage wrote into the workspace.
    pub async fn load(ctx: &ToolContext) -> Result<Self> {
        let path = ctx.resolve(ANALYSIS_FILE)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BerthError::not_found("file", ANALYSIS_FILE));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&raw)?)
    }
}

#[derive(Debug, Deserialize)]
struct AnalyzeArgs {
    repo_path: PathBuf,
    #[serde(default)]
    app_name: Option<String>,
}

/// Turn an arbitrary directory name into a DNS-1123 label usable as an image
/// and Kubernetes object name.
pub fn sanitize_name(raw: &str) -> String {
    let mut name = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_lowercase());
        } else if !name.ends_with('-') {
            name.push('-');
        }
    }
    let name: String = name.trim_matches('-').chars().take(63).collect();
    let name = name.trim_end_matches('-').to_string();
    if name.is_empty() {
        "app".to_string()
    } else {
        name
    }
}

fn skip_set() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in SKIP_PATTERNS {
        builder.add(
            Glob::new(pattern)
                .map_err(|e| BerthError::execution("analyze_repository", e.to_string()))?,
        );
    }
    builder
        .build()
        .map_err(|e| BerthError::execution("analyze_repository", e.to_string()))
}

fn detect_js_framework(package_json: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(package_json).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&raw).ok()?;
    let mut deps: Vec<&str> = Vec::new();
    for key in ["dependencies", "devDependencies"] {
        if let Some(map) = manifest.get(key).and_then(|v| v.as_object()) {
            deps.extend(map.keys().map(String::as_str));
        }
    }
    const FRAMEWORKS: &[(&str, &str)] = &[
        ("next", "nextjs"),
        ("nuxt", "nuxt"),
        ("@angular/core", "angular"),
        ("react", "react"),
        ("vue", "vue"),
        ("express", "express"),
        ("koa", "koa"),
        ("fastify", "fastify"),
    ];
    FRAMEWORKS
        .iter()
        .find(|(dep, _)| deps.contains(dep))
        .map(|(_, fw)| fw.to_string())
        .or_else(|| Some("nodejs".to_string()))
}

fn detect_python_framework(repo: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(repo.join("requirements.txt"))
        .or_else(|_| std::fs::read_to_string(repo.join("pyproject.toml")))
        .ok()?
        .to_lowercase();
    ["django", "flask", "fastapi"]
        .iter()
        .find(|fw| raw.contains(*fw))
        .map(|fw| fw.to_string())
}

fn detect_port(repo: &Path) -> Result<Option<u16>> {
    let assignment = Regex::new(r"(?i)port[^\d\n]{0,16}(\d{2,5})")
        .map_err(|e| BerthError::execution("analyze_repository", e.to_string()))?;
    let script = Regex::new(r"(?:--port|PORT=)[\s=]*(\d{2,5})")
        .map_err(|e| BerthError::execution("analyze_repository", e.to_string()))?;

    let parse = |re: &Regex, text: &str| -> Option<u16> {
        re.captures_iter(text)
            .filter_map(|c| c.get(1)?.as_str().parse::<u16>().ok())
            .find(|p| *p > 0)
    };

    if let Ok(raw) = std::fs::read_to_string(repo.join("package.json")) {
        if let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&raw) {
            if let Some(scripts) = manifest.get("scripts").and_then(|v| v.as_object()) {
                for cmd in scripts.values().filter_map(|v| v.as_str()) {
                    if let Some(port) = parse(&script, cmd) {
                        return Ok(Some(port));
                    }
                }
            }
        }
    }
    for file in PORT_FILES {
        if let Ok(raw) = std::fs::read_to_string(repo.join(file)) {
            if let Some(port) = parse(&assignment, &raw) {
                return Ok(Some(port));
            }
        }
    }
    Ok(None)
}

/// Walk `repo` and classify it. Blocking; call from `spawn_blocking`.
pub fn analyze(repo: &Path, app_name: Option<String>) -> Result<RepositoryAnalysis> {
    if !repo.is_dir() {
        return Err(BerthError::validation(
            "analyze_repository",
            format!("repository path '{}' is not a directory", repo.display()),
        ));
    }
    let skip = skip_set()?;

    let mut file_count = 0usize;
    let mut by_extension: HashMap<&'static str, usize> = HashMap::new();
    let walker = walkdir::WalkDir::new(repo).into_iter().filter_entry(|e| {
        let rel = e.path().strip_prefix(repo).unwrap_or(e.path());
        rel.as_os_str().is_empty() || !skip.is_match(rel)
    });
    for entry in walker.filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        file_count += 1;
        let ext = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        if let Some(lang) = ext
            .as_deref()
            .and_then(|ext| EXTENSIONS.iter().find(|(e, _)| *e == ext))
            .map(|(_, lang)| *lang)
        {
            *by_extension.entry(lang).or_default() += 1;
        }
    }

    let marker = MARKERS.iter().find(|(file, _, _)| repo.join(file).is_file());
    let (language, build_system) = match marker {
        Some((_, lang, build)) => (lang.to_string(), Some(build.to_string())),
        None => {
            let lang = by_extension
                .iter()
                .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
                .map(|(lang, _)| lang.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            (lang, None)
        }
    };
    // A tsconfig next to package.json means the sources are TypeScript.
    let language = if language == "javascript" && repo.join("tsconfig.json").is_file() {
        "typescript".to_string()
    } else {
        language
    };

    let framework = match language.as_str() {
        "javascript" | "typescript" => detect_js_framework(&repo.join("package.json")),
        "python" => detect_python_framework(repo),
        _ => None,
    };

    let entry_points = ENTRY_POINTS
        .iter()
        .find(|(lang, _)| *lang == language)
        .map(|(_, candidates)| {
            candidates
                .iter()
                .filter(|c| repo.join(c).exists())
                .map(|c| c.to_string())
                .collect()
        })
        .unwrap_or_default();

    let app_name = sanitize_name(&app_name.unwrap_or_else(|| {
        repo.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }));

    Ok(RepositoryAnalysis {
        repo_path: repo.to_path_buf(),
        app_name,
        language,
        framework,
        build_system,
        port: detect_port(repo)?,
        entry_points,
        file_count,
    })
}

pub struct AnalyzeRepositoryTool;

#[async_trait]
impl Tool for AnalyzeRepositoryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "analyze_repository".to_string(),
            version: "1.0.0".to_string(),
            description: "Detect language, framework, build system, port and entry points of a source repository."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "required": ["repo_path"],
                "properties": {
                    "repo_path": {
                        "type": "string",
                        "minLength": 1,
                        "description": "Path to the repository to analyze"
                    },
                    "app_name": {
                        "type": "string",
                        "description": "Application name (defaults to the repository directory name)"
                    }
                }
            }),
            output_schema: json!({
                "type": "object",
                "required": ["repo_path", "app_name", "language", "file_count"]
            }),
        }
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value> {
        let args: AnalyzeArgs = parse_args("analyze_repository", arguments)?;
        let repo = if args.repo_path.is_absolute() {
            args.repo_path
        } else {
            std::env::current_dir()?.join(args.repo_path)
        };

        let app_name = args.app_name;
        let analysis = tokio::task::spawn_blocking(move || analyze(&repo, app_name))
            .await
            .map_err(|e| BerthError::execution("analyze_repository", e.to_string()))??;

        tracing::info!(
            language = %analysis.language,
            framework = ?analysis.framework,
            port = ?analysis.port,
            files = analysis.file_count,
            "Repository analyzed"
        );

        let out = ctx.resolve(ANALYSIS_FILE)?;
        tokio::fs::create_dir_all(ctx.workspace()).await?;
        tokio::fs::write(&out, serde_json::to_vec_pretty(&analysis)?).await?;

        to_output("analyze_repository", &analysis)
    }
}
