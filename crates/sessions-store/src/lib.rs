use anyhow::{Context, Result, anyhow};
use sessions_core::{
    ChunkManifest, EventEnvelope, EventKind, IsolationFlag, ModeDocument, SessionMode,
    TaskBinding, TranscriptChunk, state_dir,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Durable key/value state rooted at `.sessions/state`. Every mutation is a
/// whole-document replacement via write-temp-then-rename; readers never see a
/// partially written document.
pub struct StateStore {
    pub root: PathBuf,
    events_path: PathBuf,
}

#[derive(Debug)]
pub struct IsolationScanEntry {
    pub agent_kind: String,
    /// `None` when the document exists but cannot be parsed.
    pub flag: Option<IsolationFlag>,
}

impl StateStore {
    pub fn open(workspace: &Path) -> Result<Self> {
        let root = state_dir(workspace);
        fs::create_dir_all(root.join("isolation"))?;
        fs::create_dir_all(root.join("chunks"))?;
        let events_path = root.join("events.jsonl");
        Ok(Self { root, events_path })
    }

    // ── Mode document ───────────────────────────────────────────────────

    pub fn load_mode(&self) -> Result<Option<ModeDocument>> {
        self.read_document(&self.mode_path())
    }

    pub fn save_mode(&self, mode: SessionMode) -> Result<()> {
        self.write_document(&self.mode_path(), &ModeDocument::new(mode))
    }

    fn mode_path(&self) -> PathBuf {
        self.root.join("mode.json")
    }

    // ── Task binding document ───────────────────────────────────────────

    /// Missing document is the ordinary null binding; a document that exists
    /// but will not parse is an error the caller degrades from.
    pub fn load_binding(&self) -> Result<TaskBinding> {
        Ok(self
            .read_document::<TaskBinding>(&self.binding_path())?
            .unwrap_or_default())
    }

    pub fn save_binding(&self, binding: &TaskBinding) -> Result<()> {
        self.write_document(&self.binding_path(), binding)
    }

    fn binding_path(&self) -> PathBuf {
        self.root.join("task.json")
    }

    // ── Isolation flags, one document per agent kind ────────────────────

    pub fn load_isolation(&self, agent_kind: &str) -> Result<IsolationFlag> {
        Ok(self
            .read_document::<IsolationFlag>(&self.isolation_path(agent_kind))?
            .unwrap_or(IsolationFlag::NotDelegating))
    }

    pub fn save_isolation(&self, flag: &IsolationFlag) -> Result<()> {
        match flag {
            IsolationFlag::Delegating { agent_kind, .. } => {
                self.write_document(&self.isolation_path(agent_kind), flag)
            }
            IsolationFlag::NotDelegating => {
                Err(anyhow!("refusing to persist a NotDelegating flag; clear instead"))
            }
        }
    }

    pub fn clear_isolation(&self, agent_kind: &str) -> Result<()> {
        let path = self.isolation_path(agent_kind);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).context(format!("clear isolation flag {}", path.display())),
        }
    }

    /// Every isolation document on disk, parse failures included so the
    /// watchdog can reclaim them.
    pub fn scan_isolation(&self) -> Result<Vec<IsolationScanEntry>> {
        let dir = self.root.join("isolation");
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir).context("scan isolation directory")? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(agent_kind) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let flag = self.read_document::<IsolationFlag>(&path).ok().flatten();
            entries.push(IsolationScanEntry {
                agent_kind: agent_kind.to_string(),
                flag,
            });
        }
        entries.sort_by(|a, b| a.agent_kind.cmp(&b.agent_kind));
        Ok(entries)
    }

    fn isolation_path(&self, agent_kind: &str) -> PathBuf {
        self.root
            .join("isolation")
            .join(format!("{}.json", document_name(agent_kind)))
    }

    // ── Chunk sets ──────────────────────────────────────────────────────

    /// Replaces the whole chunk set for an agent kind in one step: chunks and
    /// manifest are staged in a fresh directory which is renamed into place,
    /// so a consumer reads either the old complete set or the new one.
    pub fn replace_chunks(
        &self,
        agent_kind: &str,
        chunks: &[TranscriptChunk],
        manifest: &ChunkManifest,
    ) -> Result<()> {
        let chunks_root = self.root.join("chunks");
        let stage = chunks_root.join(format!(".stage-{}", Uuid::now_v7()));
        fs::create_dir_all(&stage)?;
        for chunk in chunks {
            let path = stage.join(chunk_file_name(chunk.sequence_number));
            fs::write(&path, serde_json::to_vec_pretty(chunk)?)
                .with_context(|| format!("write chunk {}", path.display()))?;
        }
        fs::write(
            stage.join("manifest.json"),
            serde_json::to_vec_pretty(manifest)?,
        )?;

        let target = chunks_root.join(document_name(agent_kind));
        if target.exists() {
            fs::remove_dir_all(&target)
                .with_context(|| format!("remove stale chunk set {}", target.display()))?;
        }
        fs::rename(&stage, &target).context("activate staged chunk set")?;
        Ok(())
    }

    pub fn read_chunks(&self, agent_kind: &str) -> Result<(ChunkManifest, Vec<TranscriptChunk>)> {
        let dir = self.root.join("chunks").join(document_name(agent_kind));
        let manifest: ChunkManifest = self
            .read_document(&dir.join("manifest.json"))?
            .ok_or_else(|| anyhow!("no chunk manifest for agent kind {agent_kind}"))?;
        let mut chunks = Vec::with_capacity(manifest.chunk_count as usize);
        for seq in 1..=manifest.chunk_count {
            let path = dir.join(chunk_file_name(seq));
            let chunk: TranscriptChunk = self
                .read_document(&path)?
                .ok_or_else(|| anyhow!("missing chunk document {}", path.display()))?;
            if chunk.sequence_number != seq {
                return Err(anyhow!(
                    "chunk sequence mismatch in {}: expected {seq}, found {}",
                    path.display(),
                    chunk.sequence_number
                ));
            }
            chunks.push(chunk);
        }
        Ok((manifest, chunks))
    }

    // ── Event journal ───────────────────────────────────────────────────

    pub fn append_event(&self, kind: EventKind) -> Result<()> {
        let envelope = EventEnvelope::new(kind);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)?;
        writeln!(file, "{}", serde_json::to_string(&envelope)?)?;
        Ok(())
    }

    pub fn read_events(&self) -> Result<Vec<EventEnvelope>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.events_path)?;
        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(&line)?);
        }
        Ok(events)
    }

    // ── Document primitives ─────────────────────────────────────────────

    fn read_document<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).context(format!("read state document {}", path.display()));
            }
        };
        let value = serde_json::from_str(&raw)
            .with_context(|| format!("parse state document {}", path.display()))?;
        Ok(Some(value))
    }

    fn write_document<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        let parent = path
            .parent()
            .ok_or_else(|| anyhow!("state document has no parent: {}", path.display()))?;
        fs::create_dir_all(parent)?;
        let tmp = parent.join(format!(".tmp-{}", Uuid::now_v7()));
        fs::write(&tmp, serde_json::to_vec_pretty(value)?)
            .with_context(|| format!("stage state document {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("activate state document {}", path.display()))?;
        Ok(())
    }
}

fn chunk_file_name(seq: u32) -> String {
    format!("chunk-{seq:03}.json")
}

/// Agent kinds come from host input; keep the on-disk name to a safe subset.
/// Dots are rewritten too, an agent kind can never name `..`.
fn document_name(agent_kind: &str) -> String {
    agent_kind
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
