use criterion::{black_box, criterion_group, criterion_main, Criterion};
use volstream::codec::{deflate, inflate, unwrap_container, wrap_container, CodecId, ScratchBuffer};
use volstream::device::MemoryVolume;
use volstream::record::Record;
use volstream::stream::StreamKind;
use volstream::{VolumeReader, VolumeWriter};

fn sample(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 97) as u8 ^ (i / 4096) as u8).collect()
}

fn bench_decompress(c: &mut Criterion) {
    let data = sample(1024 * 1024);
    let gz   = deflate(&data, 6).unwrap();
    let lzo  = wrap_container(CodecId::Lzo1x, 1, &data).unwrap();
    let zstd = wrap_container(CodecId::Zstd, 3, &data).unwrap();

    c.bench_function("inflate_1mb", |b| {
        let mut scratch = ScratchBuffer::default();
        b.iter(|| inflate(black_box(&gz), &mut scratch).unwrap().len())
    });
    c.bench_function("lzo1x_container_1mb", |b| {
        let mut scratch = ScratchBuffer::default();
        b.iter(|| unwrap_container(black_box(&lzo), &mut scratch).unwrap().len())
    });
    c.bench_function("zstd_container_1mb", |b| {
        let mut scratch = ScratchBuffer::default();
        b.iter(|| unwrap_container(black_box(&zstd), &mut scratch).unwrap().len())
    });
}

fn bench_volume_roundtrip(c: &mut Criterion) {
    let payload = sample(64 * 1024);

    c.bench_function("write_read_64_records", |b| {
        b.iter(|| {
            let mut writer = VolumeWriter::new(MemoryVolume::new("bench"), 64512, 1, 1);
            for fi in 1..=64 {
                let mut record = Record::new(fi, StreamKind::FileData, payload.clone());
                writer.write_record(&mut record).unwrap();
            }
            writer.flush_block().unwrap();

            let mut reader = VolumeReader::new(writer.into_sink());
            let mut total = 0;
            while let Some(record) = reader.next_record().unwrap() {
                total += record.payload.len();
            }
            black_box(total)
        })
    });
}

criterion_group!(benches, bench_decompress, bench_volume_roundtrip);
criterion_main!(benches);
