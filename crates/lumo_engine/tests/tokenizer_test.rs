//! Tokenizer tests: text-file loading, container-metadata loading, and the
//! encode/decode contracts.

mod common;

use common::ContainerBuilder;
use lumo_engine::gguf::GgufFile;
use lumo_engine::tokenizer::Vocabulary;

fn write_vocab(name: &str, content: &str) -> std::path::PathBuf {
    common::write_temp(name, content.as_bytes())
}

#[test]
fn loads_text_vocab_with_scores() {
    let path = write_vocab("vocab_basic.txt", "a 10\nb 9\nab 8\nc 7\n▁ 6\n");
    let vocab = Vocabulary::from_text_file(&path).unwrap();
    assert_eq!(vocab.len(), 5);
    assert_eq!(vocab.bos_id, 1);
    assert_eq!(vocab.eos_id, 2);
    assert_eq!(vocab.decode(0), "a");
    assert_eq!(vocab.decode(2), "ab");
    assert_eq!(vocab.score(0), 10.0);
    std::fs::remove_file(path).unwrap();
}

#[test]
fn score_defaults_to_zero_without_trailing_number() {
    let path = write_vocab("vocab_noscore.txt", "hello\nworld extra\nnum 3.5\n");
    let vocab = Vocabulary::from_text_file(&path).unwrap();
    assert_eq!(vocab.len(), 3);
    assert_eq!(vocab.decode(0), "hello");
    assert_eq!(vocab.score(0), 0.0);
    // A non-numeric tail stays part of the token.
    assert_eq!(vocab.decode(1), "world extra");
    assert_eq!(vocab.score(2), 3.5);
    assert_eq!(vocab.decode(2), "num");
    std::fs::remove_file(path).unwrap();
}

#[test]
fn text_vocab_unescapes_tokens() {
    let path = write_vocab("vocab_escape.txt", "hello\\nworld 5\ntab\\there 4\n");
    let vocab = Vocabulary::from_text_file(&path).unwrap();
    assert_eq!(vocab.decode(0), "hello\nworld");
    assert_eq!(vocab.decode(1), "tab\there");
    std::fs::remove_file(path).unwrap();
}

#[test]
fn crlf_and_blank_lines_are_handled() {
    let path = write_vocab("vocab_crlf.txt", "a 1\r\n\r\nb 2\r\n");
    let vocab = Vocabulary::from_text_file(&path).unwrap();
    assert_eq!(vocab.len(), 2);
    assert_eq!(vocab.decode(1), "b");
    std::fs::remove_file(path).unwrap();
}

#[test]
fn encode_merges_by_score() {
    let path = write_vocab("vocab_merge.txt", "a 10\nb 9\nab 8\nc 7\n");
    let vocab = Vocabulary::from_text_file(&path).unwrap();

    // "ab" merges into the single vocab entry.
    let ids = vocab.encode("ab", 32);
    assert_eq!(ids.len(), 1);
    assert_eq!(vocab.decode(ids[0]), "ab");

    // Truncation to the caller's cap.
    assert!(vocab.encode("abc", 2).len() <= 2);

    std::fs::remove_file(path).unwrap();
}

#[test]
fn loads_vocab_from_container_metadata() {
    let path = ContainerBuilder::new(3)
        .meta_string_array("tokenizer.ggml.tokens", &["a", "b", "ab", "c", "▁"])
        .meta_f32_array("tokenizer.ggml.scores", &[5.0, 4.0, 3.0, 2.0, 1.0])
        .meta_u32("tokenizer.ggml.bos_token_id", 1)
        .meta_u32("tokenizer.ggml.eos_token_id", 2)
        .write("tok_meta.gguf");

    let gguf = GgufFile::open(&path).unwrap();
    let vocab = Vocabulary::from_container(&gguf).unwrap();
    assert_eq!(vocab.len(), 5);
    assert_eq!(vocab.bos_id, 1);
    assert_eq!(vocab.eos_id, 2);
    assert!(vocab.decode(0).starts_with('a'));
    assert_eq!(vocab.score(0), 5.0);

    // The score table drives the merge.
    let ids = vocab.encode("ab", 32);
    assert_eq!(ids, vec![2]);

    std::fs::remove_file(path).unwrap();
}

#[test]
fn container_without_scores_defaults_to_descending() {
    let path = ContainerBuilder::new(3)
        .meta_string_array("tokenizer.ggml.tokens", &["x", "y", "z"])
        .write("tok_noscores.gguf");

    let gguf = GgufFile::open(&path).unwrap();
    let vocab = Vocabulary::from_container(&gguf).unwrap();
    assert!(vocab.score(0) > vocab.score(1));
    assert!(vocab.score(1) > vocab.score(2));
    // Special ids keep the model-family defaults when metadata is silent.
    assert_eq!(vocab.bos_id, 1);
    assert_eq!(vocab.eos_id, 2);
    assert_eq!(vocab.unk_id, 0);
    assert_eq!(vocab.pad_id, 0);
    std::fs::remove_file(path).unwrap();
}

#[test]
fn metadata_ids_override_defaults() {
    let path = ContainerBuilder::new(3)
        .meta_string_array("tokenizer.ggml.tokens", &["a"])
        .meta_u32("tokenizer.ggml.bos_token_id", 11)
        .meta_u32("tokenizer.ggml.eos_token_id", 12)
        .meta_u32("tokenizer.ggml.unk_token_id", 13)
        .meta_u32("tokenizer.ggml.pad_token_id", 14)
        .write("tok_override.gguf");

    let gguf = GgufFile::open(&path).unwrap();
    let vocab = Vocabulary::from_container(&gguf).unwrap();
    assert_eq!((vocab.bos_id, vocab.eos_id, vocab.unk_id, vocab.pad_id), (11, 12, 13, 14));
    std::fs::remove_file(path).unwrap();
}

#[test]
fn container_without_token_table_fails() {
    let path = ContainerBuilder::new(3).meta_u32("some.key", 1).write("tok_none.gguf");
    let gguf = GgufFile::open(&path).unwrap();
    assert!(Vocabulary::from_container(&gguf).is_err());
    std::fs::remove_file(path).unwrap();
}

#[test]
fn decode_sequence_normalizes_sentinel_space() {
    let path = ContainerBuilder::new(3)
        .meta_string_array("tokenizer.ggml.tokens", &["▁the", "▁cat", "<0x21>"])
        .write("tok_decode.gguf");

    let gguf = GgufFile::open(&path).unwrap();
    let vocab = Vocabulary::from_container(&gguf).unwrap();
    assert_eq!(vocab.decode_sequence(&[0, 1, 2]), " the cat!");
    std::fs::remove_file(path).unwrap();
}

#[test]
fn encode_decode_round_trip_modulo_space() {
    // Merges must climb through in-vocabulary intermediates:
    // ▁+h, ▁h+e, l+l, ll+o, ▁he+llo.
    let path = write_vocab(
        "vocab_rt.txt",
        "▁ 1\nh 1\ne 1\nl 1\no 1\n▁h 2\n▁he 3\nll 2\nllo 3\n▁hello 10\n",
    );
    let vocab = Vocabulary::from_text_file(&path).unwrap();
    let ids = vocab.encode("▁hello", 32);
    assert_eq!(ids, vec![9]);
    assert_eq!(vocab.decode_sequence(&ids), " hello");
    // Determinism across calls.
    assert_eq!(vocab.encode("▁hello", 32), ids);
    std::fs::remove_file(path).unwrap();
}
