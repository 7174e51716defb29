use criterion::{criterion_group, criterion_main, Criterion};
use scribe_collab::coords::{coordinate_to_position, position_to_coordinate, DocumentPosition};
use scribe_collab::document::{Document, Node};
use scribe_collab::presence::{color_for_user, PresenceRoster};
use scribe_collab::protocol::{CollaborationUser, Envelope, Operation};
use std::hint::black_box;

/// 500 paragraphs with a list every tenth block.
fn large_document() -> Document {
    let mut blocks = Vec::new();
    for i in 0..500 {
        if i % 10 == 0 {
            blocks.push(Node::bullet_list(&["first item", "second item"]));
        } else {
            blocks.push(Node::paragraph(&format!("Paragraph {i} with some body text")));
        }
    }
    Document::new(blocks)
}

fn bench_position_to_coordinate_end(c: &mut Criterion) {
    let doc = large_document();
    let offset = doc.content_size() - 2;

    c.bench_function("position_to_coordinate_500_blocks", |b| {
        b.iter(|| black_box(position_to_coordinate(black_box(&doc), black_box(offset))))
    });
}

fn bench_coordinate_to_position_end(c: &mut Criterion) {
    let doc = large_document();
    let target = DocumentPosition::new(doc.line_count() - 1, 5);

    c.bench_function("coordinate_to_position_500_blocks", |b| {
        b.iter(|| black_box(coordinate_to_position(black_box(&doc), black_box(target))))
    });
}

fn bench_coordinate_round_trip_small(c: &mut Criterion) {
    let doc = Document::from_paragraphs(&["Title", "Body of the note"]);

    c.bench_function("coordinate_round_trip_small", |b| {
        b.iter(|| {
            let coordinate = position_to_coordinate(&doc, black_box(12));
            black_box(coordinate_to_position(&doc, coordinate))
        })
    });
}

fn bench_same_serialized(c: &mut Criterion) {
    let doc = large_document();
    let copy = doc.clone();

    c.bench_function("same_serialized_500_blocks", |b| {
        b.iter(|| black_box(doc.same_serialized(black_box(&copy))))
    });
}

fn bench_edit_envelope_encode(c: &mut Criterion) {
    let doc = large_document();
    let ops = vec![Operation::SetContent { content: doc }];
    let payload = serde_json::json!({ "noteId": "note-1", "operations": ops, "version": 7 });

    c.bench_function("edit_envelope_encode_500_blocks", |b| {
        b.iter(|| black_box(Envelope::new("document:edit", payload.clone()).encode().unwrap()))
    });
}

fn bench_color_for_user(c: &mut Criterion) {
    c.bench_function("color_for_user_object_id", |b| {
        b.iter(|| black_box(color_for_user(black_box("65f1c2a9e4b0a1b2c3d4e5f6"))))
    });
}

fn bench_roster_set_100(c: &mut Criterion) {
    let users: Vec<CollaborationUser> = (0..100)
        .map(|i| {
            let id = format!("user-{i}");
            CollaborationUser::new(&id, format!("User {i}"), format!("s-{i}"), color_for_user(&id))
        })
        .collect();

    c.bench_function("roster_set_100_users", |b| {
        b.iter(|| {
            let mut roster = PresenceRoster::new();
            roster.set_roster(users.iter().cloned());
            black_box(roster.len())
        })
    });
}

criterion_group!(
    benches,
    bench_position_to_coordinate_end,
    bench_coordinate_to_position_end,
    bench_coordinate_round_trip_small,
    bench_same_serialized,
    bench_edit_envelope_encode,
    bench_color_for_user,
    bench_roster_set_100,
);
criterion_main!(benches);
