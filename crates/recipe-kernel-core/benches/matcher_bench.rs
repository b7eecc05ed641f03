use criterion::{criterion_group, criterion_main, Criterion};
use recipe_kernel_core::{
    best_match, Category, InMemoryCatalog, Item, LookupStrategy, MatchOptions, MatchPolicy,
    SlotTarget,
};

struct Fixture {
    catalog: InMemoryCatalog,
    supplied: Vec<Item>,
}

fn mk_catalog(templates: usize) -> Fixture {
    let mut catalog = InMemoryCatalog::new();
    let categories = (0..8)
        .map(|index| match catalog.add_category(&format!("category {index}")) {
            Ok(category) => category,
            Err(err) => panic!("bench category failed: {err}"),
        })
        .collect::<Vec<Category>>();
    let items = (0..32)
        .map(|index| {
            let category_id = categories[index % categories.len()].category_id;
            match catalog.add_item(&format!("item {index}"), category_id) {
                Ok(item) => item,
                Err(err) => panic!("bench item failed: {err}"),
            }
        })
        .collect::<Vec<Item>>();

    for index in 0..templates {
        let width = 1 + index % 5;
        let targets = (0..width)
            .map(|offset| {
                let pick = index.wrapping_mul(7).wrapping_add(offset * 5);
                if (index + offset) % 3 == 0 {
                    SlotTarget::Category(categories[pick % categories.len()].category_id)
                } else {
                    SlotTarget::Item(items[pick % items.len()].item_id)
                }
            })
            .collect::<Vec<_>>();
        if let Err(err) = catalog.add_recipe(&format!("recipe {index}"), targets) {
            panic!("bench recipe failed: {err}");
        }
    }

    let supplied = vec![items[3].clone(), items[10].clone(), items[17].clone()];
    Fixture { catalog, supplied }
}

fn bench_lookup(c: &mut Criterion) {
    let fixture = mk_catalog(1_000);

    for strategy in [LookupStrategy::BruteForce, LookupStrategy::Indexed] {
        let options = MatchOptions { strategy, policy: MatchPolicy::Greedy };
        c.bench_function(&format!("best_match_{}_1000_templates", strategy.as_str()), |b| {
            b.iter(|| {
                if let Err(err) = best_match(&fixture.catalog, &fixture.supplied, options) {
                    panic!("best match benchmark failed: {err}");
                }
            });
        });
    }
}

fn bench_exhaustive(c: &mut Criterion) {
    let fixture = mk_catalog(1_000);
    let options =
        MatchOptions { strategy: LookupStrategy::Indexed, policy: MatchPolicy::Exhaustive };

    c.bench_function("best_match_exhaustive_1000_templates", |b| {
        b.iter(|| {
            if let Err(err) = best_match(&fixture.catalog, &fixture.supplied, options) {
                panic!("exhaustive benchmark failed: {err}");
            }
        });
    });
}

criterion_group!(matcher_benches, bench_lookup, bench_exhaustive);
criterion_main!(matcher_benches);
