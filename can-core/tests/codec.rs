use can_core::utils::{dlc_to_len, is_error_frame, len_to_dlc, sanitize_fd_len, DLC_TO_LEN};
use can_core::IdentifierFlags;

#[test]
fn test_len_to_dlc() {
    let inputs = [0usize, 1, 8, 9, 12, 13, 20, 48, 64, 65, 100];
    let expected = [0u8, 1, 8, 9, 9, 10, 11, 14, 15, 15, 15];
    for (len, dlc) in inputs.iter().zip(expected) {
        assert_eq!(len_to_dlc(*len), dlc, "length {}", len);
    }
}

#[test]
fn test_dlc_to_len() {
    let table = [0usize, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];
    for (dlc, len) in table.iter().enumerate() {
        assert_eq!(dlc_to_len(dlc as u8), *len);
    }
    // only the low 4 bits count
    assert_eq!(dlc_to_len(0x1F), 64);
    assert_eq!(dlc_to_len(0x10), 0);
}

#[test]
fn test_sanitize_is_smallest_legal_length() {
    for len in 0..=64usize {
        let sanitized = sanitize_fd_len(len);
        let smallest = DLC_TO_LEN.iter().copied().filter(|&l| l >= len).min().unwrap();
        assert_eq!(sanitized, smallest, "length {}", len);
    }
    assert_eq!(sanitize_fd_len(65), 64);
    assert_eq!(sanitize_fd_len(1000), 64);
}

#[test]
fn test_dlc_round_trip() {
    for dlc in 0..16u8 {
        assert_eq!(len_to_dlc(dlc_to_len(dlc)), dlc);
    }
}

#[test]
fn test_error_flag() {
    assert!(is_error_frame(0x0000_0040 | IdentifierFlags::ERROR.bits()));
    assert!(!is_error_frame(0x123));
    assert!(!is_error_frame(0x1234_5678 | IdentifierFlags::EXTENDED.bits()));
}
