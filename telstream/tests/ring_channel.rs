//! Writer, reader and viewer behaviour of a ring buffer channel shared
//! between handles of one process.

mod common;

use std::thread;
use std::time::Duration;

use common::{attach, create_or_skip, geometry, init_test_tracing};
use telstream::ipc::{RingBufferChannel, RingError, Role, Timeout};

const WAIT: Timeout = Timeout::Duration(Duration::from_secs(5));

#[test]
fn blocks_reach_the_reader_in_order() {
    init_test_tracing();
    let Some(creator) = create_or_skip(geometry(4, 8192, 1)) else {
        return;
    };
    let mut writer = attach(creator.key(), Role::Writer);
    let mut reader = attach(creator.key(), Role::Reader);

    writer.write_header(b"SOURCE J0437\n").unwrap();
    for (i, bytes) in [8192usize, 8192, 1024].into_iter().enumerate() {
        let mut block = writer.open_block().unwrap();
        assert_eq!(block.id(), i as u64);
        block.as_mut_slice()[..bytes].fill(i as u8 + 1);
        writer.close_block(block, bytes).unwrap();
    }
    writer.close_observation().unwrap();

    assert_eq!(reader.read_header(WAIT).unwrap(), b"SOURCE J0437\n");
    for (i, bytes) in [8192usize, 8192, 1024].into_iter().enumerate() {
        let block = reader.open_read_block(WAIT).unwrap().expect("data block");
        assert_eq!(block.id(), i as u64);
        assert_eq!(block.len(), bytes);
        assert!(block.as_slice().iter().all(|&b| b == i as u8 + 1));
        assert!(block.is_intact());
        reader.close_read_block(block).unwrap();
    }
    assert!(reader.open_read_block(WAIT).unwrap().is_none());
}

#[test]
fn only_one_block_open_at_a_time() {
    init_test_tracing();
    let Some(creator) = create_or_skip(geometry(4, 4096, 0)) else {
        return;
    };
    let mut writer = attach(creator.key(), Role::Writer);
    assert!(matches!(writer.open_block(), Err(RingError::HeaderNotWritten)));

    writer.write_header(b"A 1\n").unwrap();
    let block = writer.open_block().unwrap();
    assert!(writer.is_block_open());
    assert!(matches!(
        writer.open_block(),
        Err(RingError::BlockAlreadyOpen { id: 0 })
    ));
    assert!(matches!(
        writer.close_observation(),
        Err(RingError::BlockAlreadyOpen { id: 0 })
    ));
    writer.close_block(block, 4096).unwrap();
    assert!(!writer.is_block_open());
    assert!(matches!(
        writer.write_header(b"A 2\n"),
        Err(RingError::HeaderAlreadyWritten)
    ));
}

#[test]
fn second_writer_is_refused() {
    init_test_tracing();
    let Some(creator) = create_or_skip(geometry(4, 4096, 1)) else {
        return;
    };
    let mut first = attach(creator.key(), Role::Writer);
    let mut second = RingBufferChannel::new(creator.key());
    second.connect().unwrap();
    assert!(matches!(
        second.lock(Role::Writer),
        Err(RingError::WriterLocked { .. })
    ));

    first.unlock().unwrap();
    second.lock(Role::Writer).unwrap();
    assert_eq!(second.role(), Some(Role::Writer));
}

#[test]
fn reader_slots_are_limited() {
    init_test_tracing();
    let Some(creator) = create_or_skip(geometry(4, 4096, 1)) else {
        return;
    };
    let _reader = attach(creator.key(), Role::Reader);
    let mut extra = RingBufferChannel::new(creator.key());
    extra.connect().unwrap();
    assert!(matches!(
        extra.lock(Role::Reader),
        Err(RingError::NoReaderSlot { nreaders: 1, .. })
    ));
    // Viewers never take a slot.
    extra.lock(Role::Viewer).unwrap();
}

#[test]
fn empty_close_discards_the_block() {
    init_test_tracing();
    let Some(creator) = create_or_skip(geometry(4, 4096, 0)) else {
        return;
    };
    let mut writer = attach(creator.key(), Role::Writer);
    writer.write_header(b"A 1\n").unwrap();

    let block = writer.open_block().unwrap();
    writer.close_block(block, 0).unwrap();
    assert_eq!(writer.write_count().unwrap(), 0);

    let block = writer.open_block().unwrap();
    assert_eq!(block.id(), 0);
    assert!(matches!(
        writer.close_block(block, 4097),
        Err(RingError::BytesExceedBlock { .. })
    ));
}

#[test]
fn split_block_closes_only_when_joined() {
    init_test_tracing();
    let Some(creator) = create_or_skip(geometry(4, 8192, 1)) else {
        return;
    };
    let mut writer = attach(creator.key(), Role::Writer);
    let mut reader = attach(creator.key(), Role::Reader);
    writer.write_header(b"A 1\n").unwrap();

    let block = writer.open_block().unwrap();
    let (mut low, rest) = block.split_at(2048);
    let (mut mid, mut high) = rest.split_at(2048);
    assert_eq!(high.offset_in_block(), 4096);
    assert!(high.write_at(4000, &[3; 96]));
    assert!(!high.write_at(4000, &[3; 97]));

    // Not adjacent.
    let (low_back, high_back) = low.join(high).unwrap_err();
    low = low_back;
    high = high_back;

    low.as_mut_slice().fill(1);
    mid.as_mut_slice().fill(2);
    high.as_mut_slice()[..4000].fill(3);
    let block = high.join(mid).unwrap().join(low).unwrap();
    assert!(block.is_whole());
    writer.close_block(block, 8192).unwrap();

    reader.read_header(WAIT).unwrap();
    let block = reader.open_read_block(WAIT).unwrap().unwrap();
    assert!(block.as_slice()[..2048].iter().all(|&b| b == 1));
    assert!(block.as_slice()[2048..4096].iter().all(|&b| b == 2));
    assert!(block.as_slice()[4096..].iter().all(|&b| b == 3));
    reader.close_read_block(block).unwrap();
}

#[test]
fn partial_block_cannot_be_closed() {
    init_test_tracing();
    let Some(creator) = create_or_skip(geometry(4, 8192, 0)) else {
        return;
    };
    let mut writer = attach(creator.key(), Role::Writer);
    writer.write_header(b"A 1\n").unwrap();

    let (low, _high) = writer.open_block().unwrap().split_at(4096);
    assert!(matches!(
        writer.close_block(low, 4096),
        Err(RingError::PartialBlock { id: 0 })
    ));
    assert!(writer.is_block_open());
}

#[test]
fn writer_waits_for_slow_reader() {
    init_test_tracing();
    let Some(creator) = create_or_skip(geometry(2, 4096, 1)) else {
        return;
    };
    let mut writer = attach(creator.key(), Role::Writer);
    let mut reader = attach(creator.key(), Role::Reader);
    writer.write_header(b"A 1\n").unwrap();
    for _ in 0..2 {
        let block = writer.open_block().unwrap();
        writer.close_block(block, 4096).unwrap();
    }
    assert!(matches!(
        writer.open_block_within(Timeout::Duration(Duration::from_millis(50))),
        Err(RingError::Timeout { .. })
    ));

    reader.read_header(WAIT).unwrap();
    let block = reader.open_read_block(WAIT).unwrap().unwrap();
    assert_eq!(block.id(), 0);
    reader.close_read_block(block).unwrap();

    let block = writer
        .open_block_within(Timeout::Duration(Duration::from_secs(1)))
        .unwrap();
    assert_eq!(block.id(), 2);
    writer.close_block(block, 4096).unwrap();
}

#[test]
fn lapped_viewer_skips_to_newest_block() {
    init_test_tracing();
    let Some(creator) = create_or_skip(geometry(4, 4096, 0)) else {
        return;
    };
    let mut writer = attach(creator.key(), Role::Writer);
    let mut viewer = attach(creator.key(), Role::Viewer);
    writer.write_header(b"A 1\n").unwrap();
    for i in 0..10u8 {
        let mut block = writer.open_block().unwrap();
        block.as_mut_slice().fill(i);
        writer.close_block(block, 4096).unwrap();
    }

    assert_eq!(viewer.read_header(WAIT).unwrap(), b"A 1\n");
    // A viewer may read the header as often as it likes.
    assert_eq!(viewer.read_header(WAIT).unwrap(), b"A 1\n");
    let block = viewer.open_read_block(WAIT).unwrap().unwrap();
    assert_eq!(block.id(), 9);
    assert!(block.as_slice().iter().all(|&b| b == 9));
    viewer.close_read_block(block).unwrap();
}

#[test]
fn reader_moves_on_to_the_next_observation() {
    init_test_tracing();
    let Some(creator) = create_or_skip(geometry(4, 4096, 1)) else {
        return;
    };
    let key = creator.key();
    let mut reader = attach(key, Role::Reader);

    let producer = thread::spawn(move || {
        let mut writer = attach(key, Role::Writer);
        for obs in 1..=2u8 {
            writer.write_header(format!("OBS {obs}\n").as_bytes()).unwrap();
            let mut block = writer.open_block().unwrap();
            block.as_mut_slice().fill(obs);
            writer.close_block(block, 4096).unwrap();
            writer.close_observation().unwrap();
        }
    });

    for obs in 1..=2u8 {
        assert_eq!(reader.read_header(WAIT).unwrap(), format!("OBS {obs}\n").as_bytes());
        assert!(matches!(
            reader.read_header(WAIT),
            Err(RingError::HeaderAlreadyRead)
        ));
        let block = reader.open_read_block(WAIT).unwrap().unwrap();
        assert!(block.as_slice().iter().all(|&b| b == obs));
        reader.close_read_block(block).unwrap();
        assert!(reader.open_read_block(WAIT).unwrap().is_none());
    }
    producer.join().unwrap();
}
