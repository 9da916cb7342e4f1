#![no_main]
use std::error::Error;

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: (u32, bool, &[u8])| {
    let (maxlen, strict, data) = data;
    let _ = fuzz(maxlen, strict, data);
});

fn fuzz(maxlen: u32, strict: bool, mut data: &[u8]) -> Result<(), Box<dyn Error>> {
    // deserialize random bytes, either as a stream or as a whole buffer
    let pdu = if strict {
        dicom_ulp::pdu::read_pdu(&mut data, maxlen, true)?
    } else {
        dicom_ulp::pdu::decode_pdu(data)?
    };

    // serialize pdu back to bytes
    let bytes = dicom_ulp::pdu::encode_pdu(&pdu)?;

    // deserialize back to pdu
    let pdu2 = dicom_ulp::pdu::decode_pdu(&bytes)
        .expect("serialized pdu should always deserialize");

    assert_eq!(
        pdu, pdu2,
        "pdu should be equal after serializing to/from bytes"
    );

    Ok(())
}
