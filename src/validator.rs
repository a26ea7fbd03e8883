use std::fs;
use std::io;
use std::path::Path;

pub const DEFAULT_KEYWORDS: &[&str] = &[
    "rm -rf",
    "sudo",
    "os.system",
    "subprocess",
    "exec",
    "eval",
    "cryptomine",
    "bitcoin",
    "monero",
    "mining",
    "forkbomb",
];

const SCRIPT_EXTENSIONS: &[&str] = &["py", "sh", "bash"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Malicious(String),
}

/// Decides whether extracted upload content may run on this host.
pub trait Validator: Send + Sync {
    fn scan(&self, dir: &Path) -> io::Result<Verdict>;
}

/// Flags script files that mention any of a list of keywords.
#[derive(Debug, Clone)]
pub struct KeywordScanner {
    keywords: Vec<String>,
}

impl KeywordScanner {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keywords: keywords
                .into_iter()
                .map(|k| k.into().to_lowercase())
                .collect(),
        }
    }

    fn scan_file(&self, path: &Path) -> Verdict {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let content = match fs::read(path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).to_lowercase(),
            Err(e) => return Verdict::Malicious(format!("unreadable script {name}: {e}")),
        };
        match self.keywords.iter().find(|kw| content.contains(kw.as_str())) {
            Some(kw) => Verdict::Malicious(format!("keyword '{kw}' found in {name}")),
            None => Verdict::Clean,
        }
    }

    fn walk(&self, dir: &Path) -> io::Result<Verdict> {
        let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let path = entry.path();
            let file_type = entry.file_type()?;
            let verdict = if file_type.is_symlink() {
                Verdict::Malicious(format!(
                    "symbolic link {}",
                    entry.file_name().to_string_lossy()
                ))
            } else if file_type.is_dir() {
                self.walk(&path)?
            } else if is_script(&path) {
                self.scan_file(&path)
            } else {
                Verdict::Clean
            };
            if verdict != Verdict::Clean {
                return Ok(verdict);
            }
        }
        Ok(Verdict::Clean)
    }
}

impl Default for KeywordScanner {
    fn default() -> Self {
        Self::new(DEFAULT_KEYWORDS.iter().copied())
    }
}

impl Validator for KeywordScanner {
    fn scan(&self, dir: &Path) -> io::Result<Verdict> {
        self.walk(dir)
    }
}

fn is_script(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SCRIPT_EXTENSIONS.contains(&e))
}
