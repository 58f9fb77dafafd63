use super::*;

#[test]
fn none_is_a_singleton() {
    assert!(Obj::none().is(&Obj::none()));
    assert!(Obj::none().is_none());
}

#[test]
fn equal_values_keep_distinct_identities() {
    let a = Obj::str("hello");
    let b = Obj::str("hello");
    assert_eq!(a, b);
    assert!(!a.is(&b));
    assert_ne!(a.identity(), b.identity());
    assert_eq!(a.identity(), a.clone().identity());
}

#[test]
fn bare_objects_compare_by_identity() {
    let a = Obj::bare();
    let b = Obj::bare();
    assert_ne!(a, b);
    assert_eq!(a, a.clone());
}

#[test]
fn repr_of_containers() {
    let t = Obj::tuple(vec![Obj::int(1)]);
    assert_eq!(t.repr(), "(1,)");
    let l = Obj::list(vec![Obj::int(1), Obj::str("x")]);
    assert_eq!(l.repr(), "[1, 'x']");
    let d = Obj::dict([("k", Obj::bool(true))]);
    assert_eq!(d.repr(), "{'k': True}");
}

#[test]
fn dict_get_and_set() {
    let d = Obj::dict(Vec::<(String, Obj)>::new());
    assert!(d.dict_set("a", Obj::int(3)));
    assert_eq!(d.dict_get("a"), Some(Obj::int(3)));
    assert!(!Obj::int(1).dict_set("a", Obj::none()));
}

#[test]
fn truthiness() {
    assert!(!Obj::int(0).is_truthy());
    assert!(Obj::int(2).is_truthy());
    assert!(!Obj::str("").is_truthy());
    assert!(!Obj::list(vec![]).is_truthy());
    assert!(Obj::bare().is_truthy());
}

#[test]
fn class_instances_report_class_name() {
    let class = Obj::class(HostClass::new("pkg", "Point").method("norm", |_, _, _| Ok(Obj::int(0))));
    let inst = Obj::instance_of(&class);
    assert_eq!(inst.type_name(), "Point");
    match &*inst {
        HostObject::Instance(i) => {
            assert!(i.class().is(&class));
            assert!(i.class_def().map(|c| c.has_method("norm")).unwrap_or(false));
            i.set_attr("x", Obj::int(4));
            assert_eq!(i.get_attr("x"), Some(Obj::int(4)));
        }
        _ => panic!("expected instance"),
    }
    if let HostObject::Class(c) = &*class {
        assert_eq!(c.qualified_name(), "pkg.Point");
    }
}
