//! Disk I/O and file lifecycle.
//!
//! Preallocates the destination file directly (fallocate on Linux when
//! available, else set_len), and supports concurrent offset writes (pwrite)
//! from N Part Workers writing into disjoint, pre-computed ranges. Unlike a
//! staged temp-then-rename writer, parts are written straight into
//! `destination_path` so a paused/resumed job reopens the same file it left
//! off at.

mod builder;
mod writer;

pub use builder::StorageWriterBuilder;
pub use writer::StorageWriter;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn create_preallocate_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("output.bin");

        let mut builder = StorageWriterBuilder::create(&dest).unwrap();
        builder.preallocate(100).unwrap();
        let writer = builder.build();

        writer.write_at(0, b"hello").unwrap();
        writer.write_at(50, b"world").unwrap();
        writer.write_at(95, b"xy").unwrap();
        writer.sync().unwrap();

        assert!(dest.exists());
        let mut f = std::fs::File::open(&dest).unwrap();
        let mut buf = vec![0u8; 100];
        f.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[0..5], b"hello");
        assert_eq!(&buf[50..55], b"world");
        assert_eq!(&buf[95..97], b"xy");
    }

    #[test]
    fn concurrent_writers_share_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        let mut builder = StorageWriterBuilder::create(&dest).unwrap();
        builder.preallocate(20).unwrap();
        let writer = builder.build();
        let w2 = writer.clone();
        writer.write_at(0, b"aaaa").unwrap();
        w2.write_at(10, b"bbbb").unwrap();
        writer.write_at(4, b"cccc").unwrap();
        writer.sync().unwrap();
        let mut f = std::fs::File::open(&dest).unwrap();
        let mut buf = vec![0u8; 20];
        f.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[0..4], b"aaaa");
        assert_eq!(&buf[4..8], b"cccc");
        assert_eq!(&buf[10..14], b"bbbb");
    }

    #[test]
    fn reopen_existing_for_resume() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("resume.bin");
        {
            let mut builder = StorageWriterBuilder::create(&dest).unwrap();
            builder.preallocate(10).unwrap();
            let writer = builder.build();
            writer.write_at(0, b"part1").unwrap();
        }
        let writer = StorageWriter::open_existing(&dest).unwrap();
        writer.write_at(5, b"part2").unwrap();
        let mut f = std::fs::File::open(&dest).unwrap();
        let mut buf = vec![0u8; 10];
        f.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"part1part2");
    }
}
