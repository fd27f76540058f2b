//! Line-oriented command surface over a [`Client`].

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use byte_unit::Byte;
use bytes::Bytes;
use crate::client::Client;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Shell<W: Write> {
    client: Arc<Client>,
    out: W,
    download_dir: PathBuf,
}

impl<W: Write> Shell<W> {
    pub fn new(client: Arc<Client>, out: W) -> Shell<W> {
        Shell {
            client,
            out,
            download_dir: PathBuf::from("."),
        }
    }

    /// Directory downloaded files are written to.
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Shell<W> {
        self.download_dir = dir.into();
        self
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub async fn prompt(&self) -> String {
        let pwd = self.client.pwd().await.unwrap_or_else(|_| "?".to_string());
        format!("{pwd}> ")
    }

    /// Run one command line. Command failures are reported to the output and
    /// the session continues; only a broken output stream is an error.
    pub async fn execute(&mut self, line: &str) -> Result<Flow> {
        let args: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, rest)) = args.split_first() else {
            return Ok(Flow::Continue);
        };
        let arg = rest.first().copied();

        match (command, arg) {
            ("exit", _) => {
                writeln!(self.out, "Exiting...")?;
                return Ok(Flow::Exit);
            }
            ("ls", _) => match self.client.ls().await {
                Ok(names) => writeln!(self.out, "Contents: {}", names.join(" "))?,
                Err(e) => writeln!(self.out, "Error: {e}")?,
            },
            ("pwd", _) => match self.client.pwd().await {
                Ok(path) => writeln!(self.out, "{path}")?,
                Err(e) => writeln!(self.out, "Error: {e}")?,
            },
            ("cd", Some(dir)) => {
                if let Err(e) = self.client.cd(dir).await {
                    writeln!(self.out, "Error: {e}")?;
                }
            }
            ("mkdir", Some(dir)) => {
                if let Err(e) = self.client.mkdir(dir).await {
                    writeln!(self.out, "Error: {e}")?;
                }
            }
            ("upload", Some(path)) => self.upload(Path::new(path)).await?,
            ("download", Some(name)) => self.download(name).await?,
            ("rm", Some(name)) => match self.client.delete(name).await {
                Ok(report) if report.copies_failed > 0 => writeln!(
                    self.out,
                    "File '{name}' deleted; {} chunk copies could not be removed.",
                    report.copies_failed
                )?,
                Ok(_) => writeln!(self.out, "File '{name}' deleted successfully.")?,
                Err(e) => writeln!(self.out, "Failed to delete '{name}': {e}")?,
            },
            ("meta", Some(name)) => match self.client.meta(name).await {
                Ok(meta) => writeln!(self.out, "{}", serde_json::to_string_pretty(&*meta)?)?,
                Err(e) => writeln!(self.out, "File not found: {e}")?,
            },
            ("cd" | "mkdir", None) => writeln!(self.out, "Usage: {command} <directory>")?,
            ("upload", None) => writeln!(self.out, "Usage: upload <local-file-path>")?,
            ("download" | "rm" | "meta", None) => writeln!(self.out, "Usage: {command} <file-name>")?,
            _ => writeln!(self.out, "Unknown command: {command}")?,
        }

        Ok(Flow::Continue)
    }

    async fn upload(&mut self, path: &Path) -> Result<()> {
        let Some(filename) = path.file_name().and_then(|name| name.to_str()) else {
            writeln!(self.out, "Invalid local path: {}", path.display())?;
            return Ok(());
        };
        let data = match tokio::fs::read(path).await {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                writeln!(self.out, "Failed to read local file: {e}")?;
                return Ok(());
            }
        };

        match self.client.upload(filename, data).await {
            Ok(meta) => writeln!(
                self.out,
                "File '{}' uploaded successfully in {} chunks ({:#}).",
                filename,
                meta.chunks.len(),
                Byte::from_u64(meta.size)
            )?,
            Err(e) => writeln!(self.out, "Failed to upload '{filename}': {e}")?,
        }
        Ok(())
    }

    async fn download(&mut self, name: &str) -> Result<()> {
        let data = match self.client.download(name).await {
            Ok(data) => data,
            Err(e) => {
                writeln!(self.out, "Failed to download '{name}': {e}")?;
                return Ok(());
            }
        };

        // Only a fully reassembled file reaches the destination.
        let destination = self.download_dir.join(name);
        match tokio::fs::write(&destination, &data).await {
            Ok(()) => writeln!(
                self.out,
                "File '{}' downloaded successfully ({:#}).",
                name,
                Byte::from_u64(data.len() as u64)
            )?,
            Err(e) => writeln!(self.out, "Failed to save file locally: {e}")?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunkserver::{MemoryChunkserver, NodeClient};
    use crate::client::ClientOptions;
    use crate::master::NamespaceTree;

    fn shell(download_dir: &Path) -> Shell<Vec<u8>> {
        let nodes = (0..2)
            .map(|i| Arc::new(MemoryChunkserver::new(format!("n{i}"))) as Arc<dyn NodeClient>)
            .collect();
        let options = ClientOptions { chunk_size: 16, ..ClientOptions::default() };
        let client = Client::new(Arc::new(NamespaceTree::new()), nodes, options);
        Shell::new(Arc::new(client), Vec::new()).with_download_dir(download_dir)
    }

    fn output(shell: &Shell<Vec<u8>>) -> String {
        String::from_utf8_lossy(shell.output()).into_owned()
    }

    #[tokio::test]
    async fn test_missing_arguments_print_usage() {
        let dir = tempfile::tempdir().unwrap();
        let mut shell = shell(dir.path());
        for line in ["cd", "mkdir", "upload", "download", "rm", "meta"] {
            assert_eq!(shell.execute(line).await.unwrap(), Flow::Continue);
        }
        let out = output(&shell);
        assert_eq!(out.matches("Usage:").count(), 6);
        assert!(shell.client.ls().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_errors_do_not_end_session() {
        let dir = tempfile::tempdir().unwrap();
        let mut shell = shell(dir.path());
        assert_eq!(shell.execute("cd ..").await.unwrap(), Flow::Continue);
        assert_eq!(shell.execute("download nope").await.unwrap(), Flow::Continue);
        assert_eq!(shell.execute("frobnicate").await.unwrap(), Flow::Continue);
        assert_eq!(shell.execute("").await.unwrap(), Flow::Continue);
        let out = output(&shell);
        assert!(out.contains("Already at root"));
        assert!(out.contains("Unknown command: frobnicate"));
        assert_eq!(shell.execute("exit").await.unwrap(), Flow::Exit);
    }

    #[tokio::test]
    async fn test_failed_download_writes_no_local_file() {
        let downloads = tempfile::tempdir().unwrap();
        let nodes: Vec<Arc<MemoryChunkserver>> =
            (0..2).map(|i| Arc::new(MemoryChunkserver::new(format!("n{i}")))).collect();
        let pool = nodes.iter().map(|n| n.clone() as Arc<dyn NodeClient>).collect();
        let options = ClientOptions { chunk_size: 16, ..ClientOptions::default() };
        let client = Arc::new(Client::new(Arc::new(NamespaceTree::new()), pool, options));
        client.upload("lost.bin", Bytes::from(vec![7u8; 40])).await.unwrap();

        // Drop every copy of the middle chunk from both nodes.
        for node in &nodes {
            node.delete("/lost.bin_chunk_1").await.unwrap();
        }

        let mut shell = Shell::new(client, Vec::new()).with_download_dir(downloads.path());
        assert_eq!(shell.execute("download lost.bin").await.unwrap(), Flow::Continue);
        assert!(output(&shell).contains("Failed to download 'lost.bin'"));
        assert!(!downloads.path().join("lost.bin").exists());
    }

    #[tokio::test]
    async fn test_upload_download_round_trip() {
        let local = tempfile::tempdir().unwrap();
        let downloads = tempfile::tempdir().unwrap();
        let source = local.path().join("notes.txt");
        let content = b"the quick brown fox jumps over the lazy dog".to_vec();
        std::fs::write(&source, &content).unwrap();

        let mut shell = shell(downloads.path());
        shell.execute("mkdir docs").await.unwrap();
        shell.execute("cd docs").await.unwrap();
        shell.execute(&format!("upload {}", source.display())).await.unwrap();
        shell.execute("ls").await.unwrap();
        shell.execute("meta notes.txt").await.unwrap();
        shell.execute("download notes.txt").await.unwrap();

        let out = output(&shell);
        assert!(out.contains("uploaded successfully in 3 chunks"), "{out}");
        assert!(out.contains("Contents: notes.txt"));
        assert!(out.contains("\"chunk_id\": \"/docs/notes.txt_chunk_0\""));
        assert_eq!(std::fs::read(downloads.path().join("notes.txt")).unwrap(), content);
        assert_eq!(shell.prompt().await, "/docs> ");

        shell.execute("rm notes.txt").await.unwrap();
        assert!(output(&shell).contains("deleted successfully"));
        assert!(shell.client.ls().await.unwrap().is_empty());
    }
}
