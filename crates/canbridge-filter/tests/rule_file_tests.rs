//! 从磁盘加载规则文件

use canbridge_filter::{FilterError, FilterMatrix, LookupResult};
use std::io::Write;
use std::sync::Arc;
use std::thread;
use tempfile::NamedTempFile;

const THREE_BUS_RULES: &str = "\
# three buses: 1 = drive, 2 = sensors, 3 = logger
@3
%11 1
%12 0
I INSERT INTO CANID VALUES ('CANID_MC_STATE','00200000','MC',1,1,'U8','state');
I INSERT INTO CANID VALUES ('CANID_MC_TORQUE','00400000','MC',1,1,'FF','torque');
%13 1
%21 0
T INSERT INTO CANID VALUES ('CANID_SE_RAW','E3200000','SE',1,1,'U8','raw');
t INSERT INTO CANID VALUES ('CANID_SE_CAL','E3400000','SE',1,1,'U8','cal');
%22 1
%23 1
%31 0
%32 0
%33 1
%99 9
";

fn write_rules(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_load_three_bus_rules() {
    let file = write_rules(THREE_BUS_RULES);
    let matrix = FilterMatrix::load(file.path()).unwrap();
    assert_eq!(matrix.n(), 3);

    // 1 → 2：只放行两个 ID
    assert_eq!(matrix.decide(0x0020_0000, 0, 1).unwrap(), LookupResult::Pass);
    assert_eq!(matrix.decide(0x0060_0000, 0, 1).unwrap(), LookupResult::Block);
    // 1 → 3：空 block-on-match，全部放行
    assert_eq!(matrix.decide(0x0060_0000, 0, 2).unwrap(), LookupResult::Pass);
    // 2 → 1：只放行并翻译一个 ID
    assert_eq!(
        matrix.decide(0xE320_0000, 1, 0).unwrap(),
        LookupResult::PassTranslated(0xE340_0000)
    );
    assert_eq!(matrix.decide(0xE340_0000, 1, 0).unwrap(), LookupResult::Block);
    // 3 → 1、3 → 2：空 pass-on-match，全部阻止
    assert_eq!(matrix.decide(0x0020_0000, 2, 0).unwrap(), LookupResult::Block);
    assert_eq!(matrix.decide(0x0020_0000, 2, 1).unwrap(), LookupResult::Block);
}

#[test]
fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = FilterMatrix::load(dir.path().join("absent.txt"));
    assert!(matches!(result, Err(FilterError::Io(_))));
}

#[test]
fn test_broken_file_produces_no_matrix() {
    let file = write_rules("@2\n%11 1\n%12 0\nt x,'00200000'\n");
    let err = FilterMatrix::load(file.path()).unwrap_err();
    assert!(err.to_string().contains("line 4"), "{err}");
}

#[test]
fn test_shared_read_only_across_threads() {
    let file = write_rules(THREE_BUS_RULES);
    let matrix = Arc::new(FilterMatrix::load(file.path()).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let matrix = Arc::clone(&matrix);
            thread::spawn(move || {
                for _ in 0..1000 {
                    assert_eq!(
                        matrix.decide(0xE320_0000, 1, 0).unwrap(),
                        LookupResult::PassTranslated(0xE340_0000)
                    );
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}
