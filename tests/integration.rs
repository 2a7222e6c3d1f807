mod fixtures;

use std::{sync::Arc, thread, time::Duration, time::Instant};

use fixtures::{
    generate_random_whitespace, generate_random_whitespace_at_least_one, get_env, get_env_with,
};
use kiln::{CacheScope, Context, Environment, Error, Purity, Role, Value};

fn page_context() -> Context {
    let mut context = Context::new();
    context
        .insert(
            "site",
            Value::from_pairs([
                ("title", Value::from("Kiln")),
                ("pages", Value::from(vec!["Home", "About"])),
            ]),
        )
        .insert(
            "page",
            Value::from_pairs([
                ("title", Value::from("About")),
                ("body", Value::from("hello")),
                ("tags", Value::from(vec!["a", "b", "c"])),
            ]),
        );
    context
}

#[test]
#[ntest::timeout(100)]
fn test_basic_substitution() {
    let env = Environment::new();
    let template = env.add_template("greeting", "Hello, {{ name }}!").unwrap();

    let mut context = Context::new();
    context.insert("name", "Jessica");
    assert_eq!(
        template.render(&context).unwrap(),
        "Hello, Jessica!",
        "Rendered string should match the template."
    );
    assert_eq!(template.depends_on(), ["name"]);
}

#[test]
#[ntest::timeout(100)]
fn test_whitespace_inside_tags_is_insignificant() {
    let source = format!(
        "{{%{}for{}cat{}in{}cats{}%}}Greetings {{{{{}cat{}}}}}\n{{%{}endfor{}%}}",
        generate_random_whitespace(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace_at_least_one(),
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace(),
        generate_random_whitespace(),
    );

    let env = Environment::new();
    let template = env.from_string(&source).unwrap();
    let mut context = Context::new();
    context.insert("cats", vec!["Fluffy", "Whiskers"]);

    assert_eq!(
        template.render(&context).unwrap(),
        "Greetings Fluffy\nGreetings Whiskers\n"
    );
    assert_eq!(template.depends_on(), ["cats"]);
}

#[test]
#[ntest::timeout(100)]
fn test_rendering_is_deterministic() {
    let env = Environment::new();
    let template = env
        .from_string(
            "{% for t in page.tags | sort | reverse %}{{ loop.index }}:{{ t | upper }} {% end %}\
             {{ page.title ?? 'untitled' }}",
        )
        .unwrap();
    let context = page_context();

    let first = template.render(&context).unwrap();
    assert_eq!(first, "1:C 2:B 3:A About");
    for _ in 0..10 {
        assert_eq!(template.render(&context).unwrap(), first);
    }
}

#[test]
#[ntest::timeout(100)]
fn test_optimizer_preserves_output() {
    let sources = [
        "{{ 1 + 2 * 3 }}-{{ 'a' ~ 'b' }}-{{ [1, 2, 3] | length }}",
        "{% if true %}yes{% else %}no{% endif %}{% if false %}dead{% endif %}",
        "{% for i in 1..=3 %}{{ i }}{% if loop.last %}.{% else %},{% end %}{% end %}",
        "{% let x = 10 %}{% if x > 5 %}{{ x // 3 }}{% end %}",
        "{% match page.title %}{% case 'About' %}about{% case _ %}other{% end %}",
        "{{ page.missing ?? site.title }} {{ page?.title | lower }}",
        "{% def box(x, tag='b') %}<{{ tag }}>{{ x }}</{{ tag }}>{% enddef %}{{ box(page.title) }}",
        "{{ page.body |> upper |> replace('L', 'l') }}",
    ];
    let optimized = Environment::builder().optimize(true).build();
    let plain = Environment::builder().optimize(false).build();
    let context = page_context();

    for source in sources {
        assert_eq!(
            optimized.from_string(source).unwrap().render(&context).unwrap(),
            plain.from_string(source).unwrap().render(&context).unwrap(),
            "optimizer changed the output of {source}"
        );
    }
}

#[test]
#[ntest::timeout(100)]
fn test_null_coalesce_binds_looser_than_filters() {
    let env = Environment::new();
    let mut context = Context::new();
    context.insert("items", vec![1, 2, 3]);

    let coalesce = env.from_string("{{ items ?? [] | length }}").unwrap();
    assert_eq!(coalesce.render(&context).unwrap(), "[1, 2, 3]");

    let default = env.from_string("{{ items | default([]) | length }}").unwrap();
    assert_eq!(default.render(&context).unwrap(), "3");

    assert_eq!(coalesce.render(&Context::new()).unwrap(), "0");
    assert_eq!(default.render(&Context::new()).unwrap(), "0");
}

#[test]
#[ntest::timeout(100)]
fn test_dependencies_exclude_template_bindings() {
    let env = Environment::new();
    let template = env
        .from_string(
            "{% let heading = page.title %}\
             {% for post in site.posts %}{{ post.title }}{{ loop.index }}{% end %}\
             {% def card(item) %}{{ item.name }}{{ theme.accent }}{% enddef %}\
             {% with author = page.author %}{{ author.name }}{% end %}\
             {{ heading }}{{ card(page.featured) }}{{ range(3) | length }}",
        )
        .unwrap();

    assert_eq!(
        template.depends_on(),
        [
            "page.author",
            "page.featured",
            "page.title",
            "site.posts",
            "theme.accent"
        ]
    );
}

#[test]
#[ntest::timeout(100)]
fn test_block_purity() {
    let env = Environment::builder()
        .function("now", Purity::Impure, |_| Ok(Value::from("12:00")))
        .build();
    let template = env
        .from_string(
            "{% block title %}{{ page.title | title }}{% endblock %}\
             {% block shuffled %}{{ page.tags | shuffle | join(',') }}{% endblock %}\
             {% block clock %}{{ now() }}{% endblock %}\
             {% block external %}{{ page.body | markdown }}{% endblock %}\
             {% block included %}{% include 'partial.html' ignore missing %}{% endblock %}",
        )
        .unwrap();
    let blocks = template.block_metadata();

    assert_eq!(blocks["title"].is_pure, Purity::Pure);
    assert_eq!(blocks["shuffled"].is_pure, Purity::Impure);
    assert_eq!(blocks["clock"].is_pure, Purity::Impure);
    assert_eq!(blocks["external"].is_pure, Purity::Unknown);
    assert_eq!(blocks["included"].is_pure, Purity::Unknown);
}

#[test]
#[ntest::timeout(100)]
fn test_cache_scope_inference() {
    let env = Environment::builder()
        .page_prefixes(["page"])
        .site_prefixes(["site", "nav"])
        .build();
    let template = env
        .from_string(
            "{% block nav %}<nav>{% for p in nav.items %}{{ p }}{% end %}</nav>{% endblock %}\
             {% block content %}<main>{{ page.body }}{{ site.title }}</main>{% endblock %}\
             {% block footer %}<footer>(c) Kiln</footer>{% endblock %}\
             {% block random %}{{ site.quotes | random }}{% endblock %}\
             {% block user %}{{ user.name }}{% endblock %}",
        )
        .unwrap();
    let blocks = template.block_metadata();

    assert_eq!(blocks["nav"].cache_scope, CacheScope::Site);
    assert_eq!(blocks["nav"].inferred_role, Role::Navigation);
    assert_eq!(blocks["content"].cache_scope, CacheScope::Page);
    assert_eq!(blocks["footer"].cache_scope, CacheScope::Site);
    assert_eq!(blocks["footer"].inferred_role, Role::Footer);
    assert_eq!(blocks["random"].cache_scope, CacheScope::None);
    assert_eq!(blocks["user"].cache_scope, CacheScope::Unknown);
}

#[test]
#[ntest::timeout(100)]
fn test_block_calling_a_local_def_reads_its_body() {
    let env = Environment::builder()
        .page_prefixes(["page"])
        .site_prefixes(["site"])
        .build();
    let template = env
        .from_string(
            "{% def card() %}<h1>{{ page.title }}</h1>{% end %}\
             {% block b %}{{ card() }}{% endblock %}",
        )
        .unwrap();
    let block = &template.block_metadata()["b"];

    assert!(block.depends_on.contains("page.title"));
    assert_eq!(block.is_pure, Purity::Pure);
    assert_eq!(block.cache_scope, CacheScope::Page);
    assert_eq!(template.render(&page_context()).unwrap(), "<h1>About</h1>");
}

#[test]
#[ntest::timeout(100)]
fn test_metadata_is_empty_without_the_tree() {
    let env = Environment::builder().preserve_tree(false).build();
    let template = env
        .from_string("{% block a %}{{ page.title }}{% endblock %}")
        .unwrap();

    assert!(template.ast().is_none());
    assert!(template.block_metadata().is_empty());
    assert!(template.depends_on().is_empty());
    assert_eq!(template.render(&page_context()).unwrap(), "About");
}

#[test]
#[ntest::timeout(100)]
fn test_strict_and_lenient_undefined() {
    let source = "[{{ page.missing }}]";
    let context = page_context();

    let lenient = Environment::new().from_string(source).unwrap();
    assert_eq!(lenient.render(&context).unwrap(), "[]");

    let strict = Environment::builder().strict(true).build();
    let err = strict.from_string(source).unwrap().render(&context).unwrap_err();
    match err {
        Error::Undefined(e) => {
            assert_eq!(e.name, "page.missing");
            assert_eq!(e.line, 1);
        }
        other => panic!("expected an undefined error, got {other:?}"),
    }

    // Optional access, coalescing, defaults and definedness tests never raise.
    let tolerant = strict
        .from_string(
            "{{ page?.missing?.deeper }}{{ nope ?? 'x' }}{{ nope | default('y') }}\
             {% if nope is defined %}z{% end %}",
        )
        .unwrap();
    assert_eq!(tolerant.render(&context).unwrap(), "xy");
}

#[test]
#[ntest::timeout(100)]
fn test_self_include_hits_the_depth_limit() {
    let env = get_env_with(
        Environment::builder().max_include_depth(8),
        &[("loop.html", "x{% include 'loop.html' %}")],
    );
    let err = env
        .get_template("loop.html")
        .unwrap()
        .render(&Context::new())
        .unwrap_err();

    match err {
        Error::RecursionLimit { depth, template } => {
            assert_eq!(depth, 8);
            assert_eq!(template, "loop.html");
        }
        other => panic!("expected a recursion error, got {other:?}"),
    }
}

#[test]
#[ntest::timeout(100)]
fn test_include_cycle_hits_the_depth_limit() {
    let env = get_env(&[
        ("a.html", "a{% include 'b.html' %}"),
        ("b.html", "b{% include 'a.html' %}"),
    ]);
    let err = env
        .get_template("a.html")
        .unwrap()
        .render(&Context::new())
        .unwrap_err();

    assert!(
        matches!(err, Error::RecursionLimit { depth: 32, .. }),
        "unexpected error {err:?}"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_recursive_macro_hits_the_depth_limit() {
    let env = Environment::new();
    let template = env
        .from_string("{% def down(n) %}{{ n }}{{ down(n - 1) }}{% enddef %}{{ down(3) }}")
        .unwrap();

    assert!(matches!(
        template.render(&Context::new()).unwrap_err(),
        Error::RecursionLimit { .. }
    ));
}

#[test]
#[ntest::timeout(500)]
fn test_lexing_large_source_is_fast() {
    let mut source = String::new();
    while source.len() < 10_000 {
        source.push_str("<p>{{ page.title | upper }}</p>{% if page.tags %}{{ page.tags | join(', ') }}{% end %}\n");
    }

    let started = Instant::now();
    let template = Environment::new().from_string(&source).unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(template.render(&page_context()).unwrap().contains("<p>ABOUT</p>a, b, c"));
}

#[test]
#[ntest::timeout(100)]
fn test_template_inheritance() {
    let env = get_env(&[
        (
            "base.html",
            "<title>{% block title %}Site{% endblock %}</title>\
             <main>{% block content %}{% endblock %}</main>",
        ),
        (
            "page.html",
            "{% extends 'base.html' %}\
             {% block title %}{{ page.title }} | {{ super() }}{% endblock %}",
        ),
        (
            "post.html",
            "{% extends 'page.html' %}\
             {% block content %}{{ page.body }}{% endblock %}",
        ),
    ]);
    let context = page_context();
    let post = env.get_template("post.html").unwrap();

    assert_eq!(
        post.render(&context).unwrap(),
        "<title>About | Site</title><main>hello</main>"
    );
    assert_eq!(post.render_block("title", &context).unwrap(), "About | Site");
    assert_eq!(post.template_metadata().extends.as_deref(), Some("page.html"));

    let err = post.render_block("contnet", &context).unwrap_err();
    match err {
        Error::Runtime(e) => assert_eq!(e.suggestion.as_deref(), Some("content")),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
#[ntest::timeout(100)]
fn test_macros_with_call_blocks() {
    let env = Environment::new();
    let template = env
        .from_string(
            "{% def card(title, class='card') %}\
             <div class=\"{{ class }}\"><h2>{{ title }}</h2>{% slot %}</div>\
             {% enddef %}\
             {% call card(page.title) %}<p>{{ page.body }}</p>{% endcall %}\
             {{ card('Empty', class='bare') }}",
        )
        .unwrap();

    assert_eq!(
        template.render(&page_context()).unwrap(),
        "<div class=\"card\"><h2>About</h2><p>hello</p></div>\
         <div class=\"bare\"><h2>Empty</h2></div>"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_macro_argument_errors() {
    let env = Environment::new();
    let template = env
        .from_string("{% def greet(name) %}Hi {{ name }}{% enddef %}{{ greet(nme='x') }}")
        .unwrap();

    match template.render(&Context::new()).unwrap_err() {
        Error::Runtime(e) => assert_eq!(e.suggestion.as_deref(), Some("name")),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
#[ntest::timeout(100)]
fn test_imports() {
    let env = get_env(&[
        (
            "macros.html",
            "{% let separator = ' / ' %}\
             {% def link(url, text) %}<a href=\"{{ url }}\">{{ text }}</a>{% enddef %}",
        ),
        (
            "page.html",
            "{% import 'macros.html' as m %}{% from 'macros.html' import link as a %}\
             {{ m.link('/', 'Home') }}{{ m.separator }}{{ a('/about', 'About') }}",
        ),
        ("broken.html", "{% from 'macros.html' import lnk %}"),
    ]);

    assert_eq!(
        env.get_template("page.html").unwrap().render(&Context::new()).unwrap(),
        "<a href=\"/\">Home</a> / <a href=\"/about\">About</a>"
    );

    match env.get_template("broken.html").unwrap().render(&Context::new()).unwrap_err() {
        Error::Runtime(e) => assert_eq!(e.suggestion.as_deref(), Some("link")),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
#[ntest::timeout(100)]
fn test_includes_see_local_bindings() {
    let env = get_env(&[
        ("row.html", "<li>{{ item }} of {{ page.title }}</li>"),
        (
            "list.html",
            "{% for item in page.tags %}{% include 'row.html' %}{% end %}\
             {% include 'missing.html' ignore missing %}",
        ),
        ("bad.html", "{% include 'missing.html' %}"),
    ]);

    assert_eq!(
        env.get_template("list.html").unwrap().render(&page_context()).unwrap(),
        "<li>a of About</li><li>b of About</li><li>c of About</li>"
    );
    assert!(matches!(
        env.get_template("bad.html").unwrap().render(&page_context()).unwrap_err(),
        Error::TemplateNotFound { name } if name == "missing.html"
    ));
}

#[test]
#[ntest::timeout(100)]
fn test_fragment_cache() {
    let env = Environment::new();
    let template = env
        .from_string("{% cache 'sidebar' %}{{ count }}{% endcache %}|{{ count }}")
        .unwrap();

    let mut context = Context::new();
    context.insert("count", 1);
    assert_eq!(template.render(&context).unwrap(), "1|1");

    context.insert("count", 2);
    assert_eq!(template.render(&context).unwrap(), "1|2");

    env.clear_cache();
    assert_eq!(template.render(&context).unwrap(), "2|2");
}

#[test]
#[ntest::timeout(100)]
fn test_repetition_is_capped() {
    let template = Environment::new()
        .from_string("{{ 'x' * 9223372036854775807 }}")
        .unwrap();
    assert!(matches!(
        template.render(&Context::new()).unwrap_err(),
        Error::Runtime(_)
    ));

    let template = Environment::new()
        .from_string("{% for i in [0] * n %}.{% end %}")
        .unwrap();
    let mut context = Context::new();
    context.insert("n", Value::Int(i64::MAX));
    assert!(template.render(&context).is_err());
    context.insert("n", Value::Int(3));
    assert_eq!(template.render(&context).unwrap(), "...");
}

#[test]
#[ntest::timeout(100)]
fn test_tuple_targets_unpack() {
    let env = Environment::new();
    let template = env
        .from_string(
            "{% let first, second = page.tags[:2] %}{{ first }}{{ second }}|\
             {% for k, v in {'x': 1} %}{{ k }}={{ v }}{% end %}|\
             {% if true %}{% set a, b = [3, 4] %}{{ a }}{{ b }}{% end %}",
        )
        .unwrap();
    assert_eq!(template.render(&page_context()).unwrap(), "ab|x=1|34");

    let template = env.from_string("{% let a, b = [1, 2, 3] %}").unwrap();
    let err = template.render(&Context::new()).unwrap_err();
    assert!(err.to_string().contains("cannot unpack 3 value(s) into 2 name(s)"));
}

#[test]
#[ntest::timeout(100)]
fn test_render_timeout() {
    let env = Environment::builder()
        .render_timeout(Some(Duration::from_millis(1)))
        .build();
    let template = env
        .from_string("{% for i in range(1000) %}{% for j in range(1000) %}{{ j }}{% end %}{% end %}")
        .unwrap();

    assert!(matches!(
        template.render(&Context::new()).unwrap_err(),
        Error::Timeout { .. }
    ));
}

#[test]
#[ntest::timeout(100)]
fn test_autoescape() {
    let env = Environment::builder().autoescape(true).build();
    let template = env
        .from_string("{{ html }}|{{ html | safe }}|{% filter upper %}<b>{{ name }}</b>{% endfilter %}")
        .unwrap();

    let mut context = Context::new();
    context.insert("html", "<i>&</i>").insert("name", "x<y");
    assert_eq!(
        template.render(&context).unwrap(),
        "&lt;i&gt;&amp;&lt;/i&gt;|<i>&</i>|<B>X&LT;Y</B>"
    );
}

#[test]
#[ntest::timeout(100)]
fn test_parse_errors_carry_suggestions() {
    let env = Environment::new();

    match env.from_string("{% if a %}x{% endfor %}").unwrap_err() {
        Error::Parse(e) => {
            assert_eq!(e.line, 1);
            assert_eq!(e.suggestion.as_deref(), Some("{% endif %}"));
        }
        other => panic!("expected a parse error, got {other:?}"),
    }

    match env.from_string("{% include 'a.html' with x = 1 %}").unwrap_err() {
        Error::Parse(e) => assert_eq!(
            e.suggestion.as_deref(),
            Some("{% with x = 1 %}{% include 'a.html' %}{% end %}")
        ),
        other => panic!("expected a parse error, got {other:?}"),
    }
}

#[test]
#[ntest::timeout(1000)]
fn test_adversarial_chains_are_rejected() {
    let env = Environment::new();
    let sources = [
        format!("{{{{ x{} }}}}", ".a".repeat(20_000)),
        format!("{{{{ x{} }}}}", "?.a".repeat(20_000)),
        format!("{{{{ x{} }}}}", "[0]".repeat(20_000)),
        format!("{{{{ 1{} }}}}", " - 1".repeat(20_000)),
        format!("{{{{ 'x'{} }}}}", " * 2".repeat(20_000)),
        format!("{{{{ a{} }}}}", " and a".repeat(20_000)),
        format!("{{{{ a{} }}}}", " |> lower".repeat(20_000)),
    ];
    for source in &sources {
        match env.from_string(source).unwrap_err() {
            Error::Parse(e) => assert!(e.message.contains("maximum depth")),
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    let shallow = Environment::builder().max_nesting_depth(64).build();
    let template = shallow.from_string("{{ page.title }}").unwrap();
    assert_eq!(template.render(&page_context()).unwrap(), "About");
    assert!(shallow
        .from_string(&format!("{{{{ page{} }}}}", ".title".repeat(100)))
        .is_err());
}

#[test]
#[ntest::timeout(100)]
fn test_unknown_filter_suggests_a_name() {
    let env = Environment::new();
    let template = env.from_string("{{ name | uper }}").unwrap();

    let mut context = Context::new();
    context.insert("name", "x");
    match template.render(&context).unwrap_err() {
        Error::Runtime(e) => assert_eq!(e.suggestion.as_deref(), Some("upper")),
        other => panic!("expected a runtime error, got {other:?}"),
    }
}

#[test]
#[ntest::timeout(100)]
fn test_custom_filters_and_tests() {
    let env = Environment::builder()
        .filter("shout", Purity::Pure, |value, args| {
            let marks = args.positional().first().and_then(Value::as_i64).unwrap_or(1);
            let marks = usize::try_from(marks).map_err(|e| e.to_string())?;
            Ok(format!("{}{}", value.to_output().to_uppercase(), "!".repeat(marks)).into())
        })
        .test("short", |value, _| Ok(value.len().is_some_and(|len| len < 4)))
        .build();
    let template = env
        .from_string("{% for w in words %}{% if w is short %}{{ w | shout(2) }}{% else %}{{ w }}{% end %} {% end %}")
        .unwrap();

    let mut context = Context::new();
    context.insert("words", vec!["hey", "there"]);
    assert_eq!(template.render(&context).unwrap(), "HEY!! there ");
    assert_eq!(template.block_metadata().len(), 0);
}

#[test]
#[ntest::timeout(100)]
fn test_templates_reload_when_the_source_changes() {
    let env = Environment::new();
    env.add_template("a.html", "one").unwrap();
    assert_eq!(
        env.get_template("a.html").unwrap().render(&Context::new()).unwrap(),
        "one"
    );

    env.add_template("a.html", "two").unwrap();
    assert_eq!(
        env.get_template("a.html").unwrap().render(&Context::new()).unwrap(),
        "two"
    );
    assert_eq!(env.cached_templates(), ["a.html"]);
    assert!(env.invalidate("a.html"));
    assert!(!env.invalidate("a.html"));
}

#[test]
#[ntest::timeout(1000)]
fn test_concurrent_rendering() {
    let env = get_env(&[
        ("base.html", "[{% block body %}{% endblock %}]"),
        (
            "child.html",
            "{% extends 'base.html' %}{% block body %}{{ n }}:{{ n * n }}{% endblock %}",
        ),
    ]);
    let template = env.get_template("child.html").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|n| {
            let template = Arc::clone(&template);
            thread::spawn(move || {
                let mut context = Context::new();
                context.insert("n", n);
                (0..50)
                    .map(|_| template.render(&context).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for (n, handle) in handles.into_iter().enumerate() {
        let expected = format!("[{n}:{}]", n * n);
        assert!(handle.join().unwrap().iter().all(|out| *out == expected));
    }
}
