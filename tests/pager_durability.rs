//! End-to-end durability and round-trip tests: allocate, write, commit,
//! reopen, read back.

use pagestore::{ErrorKind, Page, Pager, PagerOptions, TransactionKind, PAGE_SIZE};
use tempfile::tempdir;

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn overflow_value_round_trips_across_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pages.db");
    let value = pattern(12288);

    let page_num = {
        let pager = Pager::open(&path).unwrap();
        let mut txn = pager.begin(TransactionKind::Write).unwrap();
        let mut run = txn.allocate_page(value.len() as u32, 0).unwrap();
        run.value_mut().copy_from_slice(&value);
        let page_num = run.page_num;
        txn.commit().unwrap();
        pager.close().unwrap();
        page_num
    };

    let pager = Pager::open(&path).unwrap();
    pager.verify().unwrap();

    let txn = pager.begin(TransactionKind::Read).unwrap();
    let page: Page<'_> = txn.get_page(page_num).unwrap();
    assert_eq!(page.overflow_size, 12288);
    assert_eq!(page.data.len(), 2 * PAGE_SIZE);
    assert_eq!(page.value(), &value[..]);
}

#[test]
fn single_page_value_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pages.db");
    let value = pattern(PAGE_SIZE);

    let page_num = {
        let pager = Pager::open(&path).unwrap();
        let mut txn = pager.begin(TransactionKind::Write).unwrap();
        let run = txn.allocate_page(0, 0).unwrap();
        run.data.copy_from_slice(&value);
        let page_num = run.page_num;
        txn.commit().unwrap();
        page_num
    };

    let pager = Pager::open(&path).unwrap();
    let txn = pager.begin(TransactionKind::Read).unwrap();
    let page = txn.get_page(page_num).unwrap();
    assert_eq!(page.overflow_size, 0);
    assert_eq!(page.data, &value[..]);
}

#[test]
fn same_transaction_reads_back_its_own_overflow_write() {
    let dir = tempdir().unwrap();
    let pager = Pager::open(dir.path().join("pages.db")).unwrap();
    let value = pattern(20000);

    let mut txn = pager.begin(TransactionKind::Write).unwrap();
    let mut run = txn.allocate_page(value.len() as u32, 0).unwrap();
    run.value_mut().copy_from_slice(&value);
    let first = run.page_num;

    let page = txn.get_page(first).unwrap();
    assert_eq!(page.overflow_size, 20000);
    assert_eq!(page.value(), &value[..]);

    // a continuation page reports the bytes remaining from it onward
    let rest = txn.get_page(first + 1).unwrap();
    assert_eq!(rest.overflow_size, 20000 - PAGE_SIZE as u32);
    assert_eq!(rest.value(), &value[PAGE_SIZE..]);
}

#[test]
fn allocations_survive_reopen_and_keep_invariants() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pages.db");

    let (single, run) = {
        let pager = Pager::open(&path).unwrap();
        let mut txn = pager.begin(TransactionKind::Write).unwrap();
        let single = txn.allocate_page(100, 0).unwrap().page_num;
        let run = txn.allocate_page(3 * PAGE_SIZE as u32, single).unwrap().page_num;
        txn.commit().unwrap();
        pager.close().unwrap();
        (single, run)
    };

    let pager = Pager::open(&path).unwrap();
    pager.verify().unwrap();

    let mut txn = pager.begin(TransactionKind::Write).unwrap();
    txn.free_page(run).unwrap();
    txn.free_page(single).unwrap();
    txn.commit().unwrap();
    pager.verify().unwrap();
}

#[test]
fn freed_overflow_pages_are_reusable_after_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pages.db");

    {
        let pager = Pager::open(&path).unwrap();
        let mut txn = pager.begin(TransactionKind::Write).unwrap();
        let first = txn.allocate_page(4 * PAGE_SIZE as u32, 0).unwrap().page_num;
        txn.commit().unwrap();

        let mut txn = pager.begin(TransactionKind::Write).unwrap();
        txn.free_page(first).unwrap();
        txn.commit().unwrap();
        pager.close().unwrap();
    }

    let pager = Pager::open(&path).unwrap();
    pager.verify().unwrap();
    let mut txn = pager.begin(TransactionKind::Write).unwrap();
    // all 13 payload pages are free again
    let big = txn.allocate_page(13 * PAGE_SIZE as u32, 0).unwrap();
    assert_eq!(big.page_num, 2);
    txn.commit().unwrap();
    pager.verify().unwrap();
}

#[test]
fn dropped_transaction_leaves_durable_state_untouched() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pages.db");

    {
        let pager = Pager::open(&path).unwrap();
        let mut txn = pager.begin(TransactionKind::Write).unwrap();
        let mut run = txn.allocate_page(5000, 0).unwrap();
        run.value_mut().fill(0xEE);
        txn.close();
        pager.close().unwrap();
    }

    let pager = Pager::open(&path).unwrap();
    pager.verify().unwrap();
    let txn = pager.begin(TransactionKind::Read).unwrap();
    let page = txn.get_page(2).unwrap();
    assert_eq!(page.overflow_size, 0);
    assert!(page.data.iter().all(|&b| b == 0));
}

#[test]
fn filling_the_file_then_freeing_everything_is_clean() {
    let dir = tempdir().unwrap();
    let pager = Pager::open(dir.path().join("pages.db")).unwrap();

    let mut txn = pager.begin(TransactionKind::Write).unwrap();
    let mut allocated = Vec::new();
    let mut near = 0;
    loop {
        match txn.allocate_page(0, near) {
            Ok(run) => {
                near = run.page_num;
                allocated.push(run.page_num);
            }
            Err(err) => {
                assert_eq!(ErrorKind::of(&err), Some(ErrorKind::NoSpace));
                break;
            }
        }
    }
    assert_eq!(allocated.len(), 13);
    txn.commit().unwrap();
    pager.verify().unwrap();

    let mut txn = pager.begin(TransactionKind::Write).unwrap();
    for page in allocated {
        txn.free_page(page).unwrap();
    }
    txn.commit().unwrap();
    pager.verify().unwrap();
}

#[test]
fn readers_run_while_a_writer_commits() {
    let dir = tempdir().unwrap();
    let pager = Pager::open(dir.path().join("pages.db")).unwrap();

    {
        let mut txn = pager.begin(TransactionKind::Write).unwrap();
        let run = txn.allocate_page(0, 0).unwrap();
        run.data.fill(0x11);
        txn.commit().unwrap();
    }

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..200 {
                    let txn = pager.begin(TransactionKind::Read).unwrap();
                    let page = txn.get_page(2).unwrap();
                    let first = page.data[0];
                    // the page is rewritten wholesale, never torn mid-byte
                    assert!(first == 0x11 || first == 0x22);
                }
            });
        }

        scope.spawn(|| {
            for _ in 0..20 {
                let mut txn = pager.begin(TransactionKind::Write).unwrap();
                let run = txn.modify_page(2).unwrap();
                run.data.fill(0x22);
                txn.commit().unwrap();
            }
        });
    });
}

#[test]
fn custom_geometry_round_trips() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("pages.db");
    let options = PagerOptions {
        initial_size: 32 * PAGE_SIZE as u64,
        pages_per_section: 8,
    };

    {
        let pager = Pager::open_with(&path, options).unwrap();
        assert_eq!(pager.page_count(), 32);
        let mut txn = pager.begin(TransactionKind::Write).unwrap();
        let run = txn.allocate_page(6 * PAGE_SIZE as u32, 0).unwrap();
        // sections own their trailing metadata pages, so a 6-page run
        // cannot sit in the first range's 5 free payload pages
        assert_eq!(run.page_num, 8);
        txn.commit().unwrap();
        pager.close().unwrap();
    }

    let pager = Pager::open_with(&path, options).unwrap();
    pager.verify().unwrap();
    assert_eq!(pager.pages_per_section(), 8);
}
