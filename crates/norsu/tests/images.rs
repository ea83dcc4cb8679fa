//! Programming, verification and copy-out of bitstream images.

mod common;

use common::*;
use norsu::Error;
use pretty_assertions::assert_eq;

#[test]
fn relocatable_image_pointers_rebased() {
    let _guard = session_guard();
    let fixture = Fixture::new();
    let rsu = fixture.open();

    let image = cmf_image([0x2000, 0x3000, 0, 0], 4);
    rsu.slot_program_buf(3, &image).unwrap();

    // The flash copy carries slot-absolute pointers.
    assert_eq!(
        signature_ptrs_at(&fixture.flash, P4_ADDR),
        [P4_ADDR + 0x2000, P4_ADDR + 0x3000, 0, 0]
    );

    // The pristine source still verifies against the relocated flash.
    rsu.slot_verify_buf(3, &image).unwrap();
    assert_eq!(rsu.slot_priority(3).unwrap(), 1);
}

#[test]
fn absolute_image_written_verbatim() {
    let _guard = session_guard();
    let fixture = Fixture::new();
    let rsu = fixture.open();

    // Pointers already carry the destination address, beyond the slot size.
    let image = cmf_image([P4_ADDR + 0x2000, 0, 0, 0], 3);
    rsu.slot_program_buf(3, &image).unwrap();

    assert_eq!(
        signature_ptrs_at(&fixture.flash, P4_ADDR),
        [P4_ADDR + 0x2000, 0, 0, 0]
    );
    assert_eq!(
        fixture.flash.read_at(P4_ADDR, image.len()),
        image
    );
    rsu.slot_verify_buf(3, &image).unwrap();
}

#[test]
fn absolute_image_for_wrong_slot_rejected() {
    let _guard = session_guard();
    let fixture = Fixture::new();
    let rsu = fixture.open();

    // Absolute, but targeting P1 rather than P4, and far enough away that
    // the rebased pointer falls outside the destination.
    let image = cmf_image([P4_ADDR + SLOT_SIZE as u64 + 0x2000, 0, 0, 0], 3);
    assert_eq!(rsu.slot_program_buf(3, &image), Err(Error::Program));
}

#[test]
fn tampered_signature_block_rejected() {
    let _guard = session_guard();
    let fixture = Fixture::new();
    let rsu = fixture.open();

    let mut image = cmf_image([0x2000, 0, 0, 0], 3);
    image[BLOCK + 0x200] ^= 0x01;
    assert_eq!(rsu.slot_program_buf(3, &image), Err(Error::Program));
}

#[test]
fn verify_detects_modified_flash() {
    let _guard = session_guard();
    let fixture = Fixture::new();
    let rsu = fixture.open();

    let image = cmf_image([0x2000, 0, 0, 0], 3);
    rsu.slot_program_buf(3, &image).unwrap();

    // Flip one byte of a data section in flash.
    let mut block = fixture.flash.read_at(P4_ADDR + 2 * BLOCK as u64, 1);
    block[0] ^= 0xFF;
    fixture.flash.write_at(P4_ADDR + 2 * BLOCK as u64, &block);

    assert_eq!(rsu.slot_verify_buf(3, &image), Err(Error::Cmp));
}

#[test]
fn raw_programming_bypasses_the_pipeline() {
    let _guard = session_guard();
    let fixture = Fixture::new();
    let rsu = fixture.open();

    // Looks like a CMF image, but raw mode must not touch it.
    let image = cmf_image([0x2000, 0, 0, 0], 3);
    rsu.slot_program_buf_raw(3, &image).unwrap();

    assert_eq!(signature_ptrs_at(&fixture.flash, P4_ADDR), [0x2000, 0, 0, 0]);
    assert_eq!(fixture.flash.read_at(P4_ADDR, image.len()), image);

    // Raw programming does not enable the slot.
    assert_eq!(rsu.slot_priority(3).unwrap(), 0);
    rsu.slot_verify_buf_raw(3, &image).unwrap();
    // Non-raw verify refuses the still-disabled slot.
    assert_eq!(rsu.slot_verify_buf(3, &image), Err(Error::Erase));
}

#[test]
fn callback_source_streams_in_chunks() {
    let _guard = session_guard();
    let fixture = Fixture::new();
    let rsu = fixture.open();

    let image = cmf_image([0x2000, 0, 0, 0], 3);
    let mut remaining = &image[..];
    rsu.slot_program_callback(3, |buf| {
        // Hand out odd-sized chunks to exercise block reassembly.
        let n = remaining.len().min(buf.len()).min(1000);
        buf[..n].copy_from_slice(&remaining[..n]);
        remaining = &remaining[n..];
        Ok(n)
    })
    .unwrap();

    assert_eq!(
        signature_ptrs_at(&fixture.flash, P4_ADDR),
        [P4_ADDR + 0x2000, 0, 0, 0]
    );
    rsu.slot_verify_buf(3, &image).unwrap();
}

#[test]
fn failing_callback_aborts_programming() {
    let _guard = session_guard();
    let fixture = Fixture::new();
    let rsu = fixture.open();

    let result = rsu.slot_program_callback(3, |_buf| Err(std::io::Error::other("pull failed")));
    assert_eq!(result, Err(Error::Callback));
    assert_eq!(rsu.slot_priority(3).unwrap(), 0);
}

#[test]
fn reprogramming_a_read_back_image_keeps_pointers() {
    let _guard = session_guard();
    let fixture = Fixture::new();
    let rsu = fixture.open();

    let image = cmf_image([0x2000, 0, 0, 0], 3);
    rsu.slot_program_buf(3, &image).unwrap();

    // Read the relocated image back out of the slot.
    let mut readback = vec![0u8; SLOT_SIZE as usize];
    rsu.slot_copy_to_buf(3, &mut readback).unwrap();
    readback.truncate(image.len());

    // Reprogram it into the same slot: it is recognized as absolute and
    // lands byte-identical, pointers still slot-absolute.
    rsu.slot_erase(3).unwrap();
    rsu.slot_program_buf(3, &readback).unwrap();

    assert_eq!(
        signature_ptrs_at(&fixture.flash, P4_ADDR),
        [P4_ADDR + 0x2000, 0, 0, 0]
    );
    rsu.slot_verify_buf(3, &readback).unwrap();
}

#[test]
fn copy_to_file_elides_unwritten_blocks() {
    let _guard = session_guard();
    let fixture = Fixture::new();
    let rsu = fixture.open();

    // Data in blocks 0 and 4, nothing in between or after.
    let mut image = vec![0xFFu8; 5 * BLOCK];
    image[..BLOCK].fill(0x11);
    image[4 * BLOCK..].fill(0x22);
    rsu.slot_program_buf_raw(3, &image).unwrap();
    rsu.slot_enable(3).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("readback.bin");
    rsu.slot_copy_to_file(3, &path).unwrap();

    // The hole is back-filled, the file ends at the last data block.
    let copied = std::fs::read(&path).unwrap();
    assert_eq!(copied.len(), 5 * BLOCK);
    assert_eq!(copied, image);
}

#[test]
fn factory_update_aliases_program() {
    let _guard = session_guard();
    let fixture = Fixture::new();
    let rsu = fixture.open();

    let image = cmf_image([0x2000, 0, 0, 0], 3);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("factory_update.rpd");
    std::fs::write(&path, &image).unwrap();

    rsu.slot_erase(3).unwrap();
    rsu.slot_program_factory_update_file(3, &path).unwrap();
    rsu.slot_verify_file(3, &path).unwrap();
    assert_eq!(rsu.slot_priority(3).unwrap(), 1);
}
