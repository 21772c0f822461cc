//! Textual rendering of build progress.
//!
//! Presentation only: nothing here influences events, ordering or the build
//! outcome, and write failures are logged and dropped. Legacy messages are
//! rendered the way the daemon CLI prints them; BuildKit batches use the plain
//! `#<step> ...` layout.

use crate::graph::{order_vertices, SolveStatus};
use crate::legacy::JsonMessage;
use colored::{ColoredString, Colorize};
use std::collections::HashSet;
use std::io::Write;
use std::time::Instant;
use tracing::warn;

/// Write-only destination for rendered build output.
pub struct OutputSink {
    writer: Box<dyn Write + Send>,
    color: bool,
    start_time: Instant,
    announced: HashSet<u64>,
    finished: HashSet<u64>,
    write_failed: bool,
}

impl OutputSink {
    pub fn new(writer: impl Write + Send + 'static, color: bool) -> Self {
        Self {
            writer: Box::new(writer),
            color,
            start_time: Instant::now(),
            announced: HashSet::new(),
            finished: HashSet::new(),
            write_failed: false,
        }
    }

    /// Sink writing to the process's standard output.
    pub fn stdout(color: bool) -> Self {
        Self::new(std::io::stdout(), color)
    }

    /// Render one legacy-shaped message.
    pub fn render_message(&mut self, msg: &JsonMessage) {
        if let Some(failure) = msg.failure() {
            let line = self.paint(&format!("ERROR: {}\n", failure), |s| s.red().bold());
            self.write(&line);
            return;
        }

        if !msg.stream.is_empty() {
            self.write(&msg.stream);
            return;
        }

        if msg.status.is_empty() {
            return;
        }

        let mut line = String::new();
        if !msg.id.is_empty() {
            line.push_str(&msg.id);
            line.push_str(": ");
        }
        line.push_str(&msg.status);
        if let Some(progress) = msg.progress.filter(|p| p.total > 0) {
            line.push_str(&format!(" {}/{}", progress.current, progress.total));
        }
        line.push('\n');

        let line = self.paint(&line, |s| s.dimmed());
        self.write(&line);
    }

    /// Render one BuildKit batch. `step_of` maps a vertex digest to its step number;
    /// records for vertices without one are skipped.
    ///
    /// Vertices are rendered in display order, or in batch order if the batch cannot
    /// be ordered.
    pub fn render_status(&mut self, status: &SolveStatus, step_of: impl Fn(&str) -> Option<u64>) {
        let vertices =
            order_vertices(&status.vertexes).unwrap_or_else(|_| status.vertexes.iter().collect());

        for vertex in vertices {
            let Some(step) = step_of(&vertex.digest) else { continue };

            if self.announced.insert(step) {
                let name = self.paint(&vertex.name, |s| s.bold());
                self.step_line(step, &name);
            }

            if vertex.cached && self.finished.insert(step) {
                let cached = self.paint("CACHED", |s| s.cyan());
                self.step_line(step, &cached);
                continue;
            }

            if !vertex.error.is_empty() {
                let error = self.paint(&format!("ERROR: {}", vertex.error), |s| s.red());
                self.step_line(step, &error);
            } else if vertex.is_completed() && self.finished.insert(step) {
                let done = format!("{} {}", self.paint("DONE", |s| s.green()), self.elapsed());
                self.step_line(step, &done);
            } else if !vertex.is_completed() {
                self.finished.remove(&step);
            }
        }

        for s in &status.statuses {
            let Some(step) = step_of(&s.vertex) else { continue };
            if s.completed.is_some() && !s.id.is_empty() {
                self.step_line(step, &format!("{} done", s.id));
            }
        }

        for log in &status.logs {
            let Some(step) = step_of(&log.vertex) else { continue };
            let text = String::from_utf8_lossy(&log.data).into_owned();
            let stamp = self.paint(&self.elapsed(), |s| s.dimmed());
            for line in text.lines() {
                self.step_line(step, &format!("{} {}", stamp, line));
            }
        }
    }

    fn paint(&self, text: &str, style: impl Fn(&str) -> ColoredString) -> String {
        if self.color {
            style(text).to_string()
        } else {
            text.to_string()
        }
    }

    fn elapsed(&self) -> String {
        format!("{:.3}", self.start_time.elapsed().as_secs_f64())
    }

    fn step_line(&mut self, step: u64, text: &str) {
        self.write(&format!("#{} {}\n", step, text));
    }

    fn write(&mut self, text: &str) {
        if self.write_failed {
            return;
        }

        if let Err(e) = self.writer.write_all(text.as_bytes()).and_then(|_| self.writer.flush()) {
            warn!("Failed to write build output, disabling output: {}", e);
            self.write_failed = true;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::graph::{Vertex, VertexLog};
    use crate::legacy::JsonProgress;
    use std::sync::{Arc, Mutex};
    use std::time::UNIX_EPOCH;

    /// Writer whose contents stay readable after the sink takes ownership of it.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(pub(crate) Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_renders_legacy_messages() {
        let buffer = SharedBuffer::default();
        let mut sink = OutputSink::new(buffer.clone(), false);

        sink.render_message(&JsonMessage {
            stream: "Step 1/1 : FROM alpine\n".into(),
            ..Default::default()
        });
        sink.render_message(&JsonMessage {
            status: "Downloading".into(),
            id: "a1b2".into(),
            progress: Some(JsonProgress { current: 5, total: 10 }),
            ..Default::default()
        });
        sink.render_message(&JsonMessage { error_message: "boom".into(), ..Default::default() });

        assert_eq!(
            buffer.contents(),
            "Step 1/1 : FROM alpine\na1b2: Downloading 5/10\nERROR: boom\n"
        );
    }

    #[test]
    fn test_renders_graph_batches() {
        let buffer = SharedBuffer::default();
        let mut sink = OutputSink::new(buffer.clone(), false);
        let step_of = |digest: &str| (digest == "d1").then_some(3);

        let running = Vertex {
            digest: "d1".into(),
            name: "[1/2] RUN make".into(),
            started: Some(UNIX_EPOCH),
            ..Default::default()
        };
        sink.render_status(
            &SolveStatus {
                vertexes: vec![running.clone()],
                logs: vec![VertexLog {
                    vertex: "d1".into(),
                    data: b"ok\n".to_vec(),
                    ..Default::default()
                }],
                ..Default::default()
            },
            step_of,
        );
        sink.render_status(
            &SolveStatus {
                vertexes: vec![Vertex { completed: Some(UNIX_EPOCH), ..running }],
                ..Default::default()
            },
            step_of,
        );

        let contents = buffer.contents();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines[0], "#3 [1/2] RUN make");
        assert!(lines[1].starts_with("#3 ") && lines[1].ends_with(" ok"));
        assert!(lines[2].starts_with("#3 DONE "));
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_cached_and_failed_vertices() {
        let buffer = SharedBuffer::default();
        let mut sink = OutputSink::new(buffer.clone(), false);

        let status = SolveStatus {
            vertexes: vec![
                Vertex {
                    digest: "a".into(),
                    name: "cached".into(),
                    cached: true,
                    ..Default::default()
                },
                Vertex {
                    digest: "b".into(),
                    name: "broken".into(),
                    error: "exit 1".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        sink.render_status(&status, |d| if d == "a" { Some(1) } else { Some(2) });

        assert_eq!(buffer.contents(), "#1 cached\n#1 CACHED\n#2 broken\n#2 ERROR: exit 1\n");
    }

    #[test]
    fn test_vertices_rendered_in_display_order() {
        let buffer = SharedBuffer::default();
        let mut sink = OutputSink::new(buffer.clone(), false);

        let status = SolveStatus {
            vertexes: vec![
                Vertex {
                    digest: "b".into(),
                    name: "exporting to image".into(),
                    ..Default::default()
                },
                Vertex {
                    digest: "a".into(),
                    name: "[1/1] FROM alpine".into(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        sink.render_status(&status, |d| if d == "a" { Some(1) } else { Some(2) });

        assert_eq!(buffer.contents(), "#1 [1/1] FROM alpine\n#2 exporting to image\n");
    }

    #[test]
    fn test_cyclic_batch_rendered_in_batch_order() {
        let buffer = SharedBuffer::default();
        let mut sink = OutputSink::new(buffer.clone(), false);

        let status = SolveStatus {
            vertexes: vec![
                Vertex {
                    digest: "b".into(),
                    name: "second".into(),
                    inputs: vec!["a".into()],
                    ..Default::default()
                },
                Vertex {
                    digest: "a".into(),
                    name: "first".into(),
                    inputs: vec!["b".into()],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        sink.render_status(&status, |d| if d == "a" { Some(1) } else { Some(2) });

        assert_eq!(buffer.contents(), "#2 second\n#1 first\n");
    }
}
