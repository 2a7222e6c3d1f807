use kiln::{Context, Value};
use rand::{Rng, SeedableRng, rngs::StdRng};

/// Generate n random page contexts to use in the benchmark
pub fn generate_random_contexts(n: usize) -> Vec<Context> {
    let mut rng = StdRng::seed_from_u64(42); // Fixed seed for reproducibility
    let site = Value::from_pairs([
        ("title", Value::from("kiln")),
        (
            "links",
            (0..5)
                .map(|i| {
                    Value::from_pairs([
                        ("url", Value::from(format!("/section-{i}"))),
                        ("label", Value::from(format!("Section {i}"))),
                    ])
                })
                .collect::<Value>(),
        ),
    ]);

    (0..n)
        .map(|_| {
            let items_count = rng.random_range(3..10);
            let items: Value = (0..items_count)
                .map(|_| {
                    Value::from_pairs([
                        ("name", Value::from(random_string(&mut rng, 3, 8))),
                        ("value", Value::from(rng.random_range(10_i64..1000))),
                    ])
                })
                .collect();
            let page = Value::from_pairs([
                ("title", Value::from(random_string(&mut rng, 5, 10))),
                (
                    "author",
                    Value::from_pairs([
                        ("name", Value::from(random_string(&mut rng, 5, 10))),
                        ("age", Value::from(rng.random_range(18_i64..80))),
                        ("active", Value::from(rng.random_bool(0.7))),
                    ]),
                ),
                ("items", items),
            ]);

            let mut context = Context::new();
            context.insert("site", site.clone()).insert("page", page);
            context
        })
        .collect()
}

/// Generate a random string with length between min and max
fn random_string(rng: &mut StdRng, min_len: usize, max_len: usize) -> String {
    let len = rng.random_range(min_len..=max_len);
    (0..len)
        .map(|_| char::from(rng.random_range(b'a'..=b'z')))
        .collect()
}
