use crate::common_io::open_buf_writer;

use std::io::Write;

/// Where per-epoch scalars go
pub trait ScalarSink {
    fn record_scalar(&mut self, tag: &str, value: f32, step: usize) -> anyhow::Result<()>;

    /// flush and release the underlying resource
    fn close(&mut self) -> anyhow::Result<()>;
}

/// Writes `tag \t step \t value` lines, gzipped for `.gz` paths
pub struct TsvScalarWriter {
    writer: Option<Box<dyn Write>>,
}

impl TsvScalarWriter {
    pub fn create(output_file: &str) -> anyhow::Result<Self> {
        let mut writer = open_buf_writer(output_file)?;
        writeln!(writer, "tag\tstep\tvalue")?;
        Ok(Self {
            writer: Some(writer),
        })
    }
}

impl ScalarSink for TsvScalarWriter {
    fn record_scalar(&mut self, tag: &str, value: f32, step: usize) -> anyhow::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or(anyhow::anyhow!("scalar writer already closed"))?;
        writeln!(writer, "{}\t{}\t{}", tag, step, value)?;
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Keeps everything in memory
#[derive(Default)]
pub struct MemorySink {
    pub records: Vec<(String, usize, f32)>,
    pub closed: bool,
}

impl MemorySink {
    /// values recorded under `tag`, in step order
    pub fn values(&self, tag: &str) -> Vec<f32> {
        self.records
            .iter()
            .filter(|(t, _, _)| t == tag)
            .map(|&(_, _, v)| v)
            .collect()
    }
}

impl ScalarSink for MemorySink {
    fn record_scalar(&mut self, tag: &str, value: f32, step: usize) -> anyhow::Result<()> {
        self.records.push((tag.to_string(), step, value));
        Ok(())
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common_io::open_buf_reader;
    use std::io::BufRead;

    #[test]
    fn tsv_writer_refuses_after_close() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("run.stats.tsv.gz");
        let path = path.to_str().ok_or(anyhow::anyhow!("path"))?;

        let mut sink = TsvScalarWriter::create(path)?;
        sink.record_scalar("loss/train", 1.5, 0)?;
        sink.record_scalar("loss/valid", 2.0, 0)?;
        sink.close()?;
        assert!(sink.record_scalar("lr", 1e-3, 1).is_err());
        drop(sink);

        let lines: Vec<String> = open_buf_reader(path)?.lines().collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "loss/train\t0\t1.5");
        Ok(())
    }
}
