use loomcore::{
    storage::StoredProgram,
    suppression::SuppressionQuery,
    tests_utils::{FooBar, Recorder, async_service, counter, foo_bar, interceptor, type_wide},
    utils::conf::{SuppressEntry, WeaverConfig},
    weaver::Weaver,
    wvlog::LogChannel,
};
use loomir::{
    analysis::analyze_method,
    body::{ExceptionHandler, HandlerKind, Instr, InstrId, MethodBody},
    interp::{Interpreter, Value},
    program::{CustomAttribute, MethodDef, Modifiers, ProgramUnit},
    types::Typeref,
};

fn events(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn interpreter<'u>(unit: &'u ProgramUnit, recorder: &Recorder, interceptors: &[&str]) -> Interpreter<'u> {
    let mut interp = Interpreter::new(unit);
    for name in interceptors {
        recorder.install(&mut interp, name);
    }
    recorder.install_builder(&mut interp);
    interp
}

#[test]
fn foo_bar_calls_hooks_around_the_original_body() {
    let mut fx = foo_bar();
    Weaver::default().weave(&mut fx.unit).unwrap();

    let recorder = Recorder::new();
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A", "Demo.B"]);

    let result = interp.call(fx.bar, vec![Value::I32(4)]).unwrap();
    assert_eq!(result.returned(), Some(Value::I32(5)));
    assert_eq!(
        recorder.events(),
        events(&["B.SyncRoot", "A.OnEnter", "B.OnEnter", "A.OnExit", "B.OnExit"])
    );

    // Interceptors are built once; later calls only run the hooks.
    recorder.clear();
    let result = interp.call(fx.bar, vec![Value::I32(41)]).unwrap();
    assert_eq!(result.returned(), Some(Value::I32(42)));
    assert_eq!(recorder.events(), events(&["A.OnEnter", "B.OnEnter", "A.OnExit", "B.OnExit"]));
}

#[test]
fn on_enter_receives_the_call_context() {
    let mut fx = foo_bar();
    Weaver::default().weave(&mut fx.unit).unwrap();

    let recorder = Recorder::new();
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A", "Demo.B"]);
    interp.call(fx.bar, vec![Value::I32(7)]).unwrap();

    let entered = recorder.entered();
    assert_eq!(entered.len(), 2);
    let foo = fx.unit.type_ref(fx.foo).unwrap();
    let [ty, instance, method, args] = entered[0].as_slice() else {
        panic!("OnEnter takes four arguments, got {:?}", entered[0]);
    };
    assert_eq!(*ty, Value::Type(foo));
    assert_eq!(*instance, Value::Null);
    assert_eq!(*method, Value::Method(fx.bar));
    let Value::Array(args) = args else {
        panic!("arguments are passed as an array");
    };
    assert_eq!(*args.borrow(), vec![Value::I32(7)]);
}

#[test]
fn unhandled_exceptions_are_rethrown_unchanged() {
    let mut fx = foo_bar();
    Weaver::default().weave(&mut fx.unit).unwrap();

    let recorder = Recorder::new();
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A", "Demo.B"]);
    let thrown = interp.call(fx.bar, vec![Value::I32(-1)]).unwrap().threw().unwrap();

    assert_eq!(thrown.object_type(), Some(fx.boom));
    assert_eq!(
        recorder.events(),
        events(&[
            "B.SyncRoot",
            "A.OnEnter",
            "B.OnEnter",
            "A.OnException",
            "B.OnException",
            "A.OnExit",
            "B.OnExit"
        ])
    );
}

#[test]
fn first_interceptor_handling_the_exception_stops_the_chain() {
    let mut fx = foo_bar();
    Weaver::default().weave(&mut fx.unit).unwrap();

    let recorder = Recorder::new();
    recorder.handles("A");
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A", "Demo.B"]);
    let result = interp.call(fx.bar, vec![Value::I32(-3)]).unwrap();

    assert_eq!(result.returned(), Some(Value::I32(0)));
    assert_eq!(
        recorder.events(),
        events(&["B.SyncRoot", "A.OnEnter", "B.OnEnter", "A.OnException", "A.OnExit", "B.OnExit"])
    );
}

#[test]
fn later_interceptor_can_still_handle_the_exception() {
    let mut fx = foo_bar();
    Weaver::default().weave(&mut fx.unit).unwrap();

    let recorder = Recorder::new();
    recorder.handles("B");
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A", "Demo.B"]);
    let result = interp.call(fx.bar, vec![Value::I32(-3)]).unwrap();

    assert_eq!(result.returned(), Some(Value::I32(0)));
    assert!(recorder.events().contains(&"B.OnException".to_string()));
}

#[test]
fn static_root_is_ready_before_the_first_call() {
    let mut fx = foo_bar();
    let report = Weaver::default().weave(&mut fx.unit).unwrap();
    let root = report.roots[0].field;

    let recorder = Recorder::new();
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A", "Demo.B"]);
    assert!(interp.static_value(root).is_none());
    interp.call(fx.bar, vec![Value::I32(1)]).unwrap();

    let root_value = interp.static_value(root).unwrap();
    assert!(root_value.is_obj());
    assert_eq!(recorder.roots(), vec![root_value]);
}

#[test]
fn instance_root_is_assigned_once_per_object() {
    let mut fx = counter();
    let report = Weaver::default().weave(&mut fx.unit).unwrap();
    assert_eq!(report.roots.len(), 1);
    assert_eq!(report.roots[0].initializers, vec![fx.ctor_value]);
    let root = report.roots[0].field;

    let recorder = Recorder::new();
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.B"]);
    let first = interp.construct(fx.ctor_default, vec![]).unwrap().returned().unwrap();
    let second = interp
        .construct(fx.ctor_value, vec![Value::I32(1)])
        .unwrap()
        .returned()
        .unwrap();

    let result = interp.call(fx.add, vec![first.clone(), Value::I32(5)]).unwrap();
    assert_eq!(result.returned(), Some(Value::I32(15)));
    let result = interp.call(fx.add, vec![second.clone(), Value::I32(5)]).unwrap();
    assert_eq!(result.returned(), Some(Value::I32(6)));

    let first_root = first.field(root).unwrap();
    let second_root = second.field(root).unwrap();
    assert_ne!(first_root, second_root);
    assert_eq!(recorder.roots(), vec![first_root, second_root]);

    let entered = recorder.entered();
    assert_eq!(entered[0][1], first);
    assert_eq!(entered[1][1], second);
}

#[test]
fn type_wide_interceptor_runs_on_promoted_methods() {
    let mut fx = type_wide();
    Weaver::default().weave(&mut fx.unit).unwrap();

    let recorder = Recorder::new();
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A"]);
    let t = interp.construct(fx.ctor, vec![]).unwrap().returned().unwrap();
    assert!(recorder.events().is_empty());

    let result = interp.call(fx.m2, vec![t.clone(), Value::I32(3)]).unwrap();
    assert_eq!(result.returned(), Some(Value::I32(5)));
    assert_eq!(recorder.events(), events(&["A.OnEnter", "A.OnExit"]));

    recorder.clear();
    interp.call(fx.getter, vec![t.clone()]).unwrap();
    interp.call(fx.ignored, vec![t]).unwrap();
    assert!(recorder.events().is_empty());
}

#[test]
fn async_method_hooks_split_between_entry_and_continuation() {
    let mut fx = async_service();
    let report = Weaver::default().weave(&mut fx.unit).unwrap();
    assert_eq!(report.woven[0].async_method, Some(fx.move_next));

    let recorder = Recorder::new();
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A", "Demo.B"]);
    let service = interp.construct(fx.service_ctor, vec![]).unwrap().returned().unwrap();

    let result = interp.call(fx.fetch, vec![service.clone(), Value::I32(2)]).unwrap();
    assert_eq!(result.returned(), Some(Value::Null));
    assert_eq!(
        recorder.events(),
        events(&["B.SyncRoot", "A.OnEnter", "B.OnEnter", "A.OnExit", "B.OnExit", "SetResult"])
    );

    recorder.clear();
    interp.call(fx.fetch, vec![service, Value::I32(-2)]).unwrap();
    assert_eq!(
        recorder.events(),
        events(&[
            "A.OnEnter",
            "B.OnEnter",
            "A.OnException",
            "B.OnException",
            "A.OnExit",
            "B.OnExit",
            "SetException"
        ])
    );
}

#[test]
fn handled_async_fault_completes_successfully() {
    let mut fx = async_service();
    Weaver::default().weave(&mut fx.unit).unwrap();

    let recorder = Recorder::new();
    recorder.handles("A");
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A", "Demo.B"]);
    let service = interp.construct(fx.service_ctor, vec![]).unwrap().returned().unwrap();
    interp.call(fx.fetch, vec![service, Value::I32(-2)]).unwrap();

    // Every interceptor still sees the exception; the fault path is skipped.
    assert_eq!(
        recorder.events(),
        events(&[
            "B.SyncRoot",
            "A.OnEnter",
            "B.OnEnter",
            "A.OnException",
            "B.OnException",
            "A.OnExit",
            "B.OnExit",
            "SetResult"
        ])
    );
}

#[test]
fn suppressed_attribution_leaves_its_siblings_woven() {
    let mut fx = foo_bar();
    let config = WeaverConfig {
        suppress: vec![SuppressEntry {
            interceptor: "Demo.A".into(),
            when: "Demo.B".into(),
        }],
        ..WeaverConfig::default()
    };
    let report = Weaver::new(config).weave(&mut fx.unit).unwrap();
    assert_eq!(report.woven[0].fields.len(), 1);

    // The suppressed attribute stays as plain metadata.
    let remaining: Vec<_> = fx
        .unit
        .method(fx.bar)
        .unwrap()
        .attributes
        .iter()
        .map(|a| a.attribute_type)
        .collect();
    assert_eq!(remaining, vec![fx.a.ty]);

    let recorder = Recorder::new();
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A", "Demo.B"]);
    interp.call(fx.bar, vec![Value::I32(0)]).unwrap();
    assert_eq!(recorder.events(), events(&["B.SyncRoot", "B.OnEnter", "B.OnExit"]));
}

#[test]
fn custom_rules_see_the_attribution() {
    let mut fx = foo_bar();
    let weaver = Weaver::default().with_rule("Demo.B", |query: &SuppressionQuery<'_>| {
        query.method_name == "Bar" && !query.type_wide
    });
    let report = weaver.weave(&mut fx.unit).unwrap();

    assert_eq!(report.woven[0].fields.len(), 1);
    assert!(report.roots.is_empty());
}

#[test]
fn assign_to_field_bindings_are_stored_after_construction() {
    let mut fx = foo_bar();
    let (named, field) = loomcore::tests_utils::interceptor_with_binding(&mut fx.unit, &fx.fw, "Demo.Named", "MethodName");
    let ctor = fx.unit.constructors(named)[0];
    fx.unit
        .method_mut(fx.bar)
        .unwrap()
        .attributes
        .push(CustomAttribute::new(named, ctor));

    let report = Weaver::default().weave(&mut fx.unit).unwrap();
    let backing = report.woven[0].fields[2];

    let recorder = Recorder::new();
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A", "Demo.B", "Demo.Named"]);
    interp.call(fx.bar, vec![Value::I32(0)]).unwrap();

    let instance = interp.static_value(backing).unwrap();
    assert_eq!(instance.field(field), Some(Value::str("Bar")));
    assert_eq!(
        recorder.events(),
        events(&[
            "B.SyncRoot",
            "A.OnEnter",
            "B.OnEnter",
            "Named.OnEnter",
            "A.OnExit",
            "B.OnExit",
            "Named.OnExit"
        ])
    );
}

#[test]
fn woven_program_survives_storage() {
    let mut fx = foo_bar();
    Weaver::default().weave(&mut fx.unit).unwrap();

    let log = LogChannel::new();
    let bytes = StoredProgram::new(fx.unit).encode(&log).unwrap();
    let stored = StoredProgram::decode(&log, &bytes).unwrap();

    let recorder = Recorder::new();
    let mut interp = interpreter(&stored.unit, &recorder, &["Demo.A", "Demo.B"]);
    let result = interp.call(fx.bar, vec![Value::I32(9)]).unwrap();
    assert_eq!(result.returned(), Some(Value::I32(10)));
    assert_eq!(recorder.events().len(), 5);
}

#[test]
fn one_root_serves_every_attribution_of_a_type() {
    let mut fx = foo_bar();
    let c = interceptor(&mut fx.unit, &fx.fw, "Demo.C", true);
    fx.unit.method_mut(fx.bar).unwrap().attributes.push(c.attribute());
    let (body, _) = MethodBody::from_instrs([Instr::LdArg(0), Instr::Ret]);
    let mut baz = MethodDef::ordinary("Baz", Typeref::I32)
        .with_modifiers(Modifiers::PUBLIC | Modifiers::STATIC)
        .with_param("x", Typeref::I32)
        .with_body(body);
    baz.attributes.push(fx.b.attribute());
    let baz = fx.unit.add_method(fx.foo, baz).unwrap();

    let report = Weaver::default().weave(&mut fx.unit).unwrap();
    assert_eq!(report.woven.len(), 2);
    assert_eq!(report.roots.len(), 1);
    let root = report.roots[0].field;
    assert!(report.woven.iter().all(|w| w.root == Some(root)));

    let recorder = Recorder::new();
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A", "Demo.B", "Demo.C"]);
    interp.call(fx.bar, vec![Value::I32(1)]).unwrap();
    let result = interp.call(baz, vec![Value::I32(2)]).unwrap();
    assert_eq!(result.returned(), Some(Value::I32(2)));
    assert_eq!(
        recorder.events(),
        events(&[
            "B.SyncRoot",
            "C.SyncRoot",
            "A.OnEnter",
            "B.OnEnter",
            "C.OnEnter",
            "A.OnExit",
            "B.OnExit",
            "C.OnExit",
            "B.SyncRoot",
            "B.OnEnter",
            "B.OnExit"
        ])
    );

    let root_value = interp.static_value(root).unwrap();
    assert_eq!(recorder.roots(), vec![root_value; 3]);
}

/// Swap the body of `Demo.Foo::Bar` and check it is valid as written.
fn with_bar_body(fx: &mut FooBar, body: MethodBody) {
    fx.unit.method_mut(fx.bar).unwrap().body = Some(body);
    analyze_method(&fx.unit, fx.bar).unwrap();
}

fn retarget(body: &mut MethodBody, ids: &[InstrId], at: usize, target: usize) {
    let instr = body.get_mut(ids[at]).unwrap();
    *instr = match instr {
        Instr::Br(_) => Instr::Br(ids[target]),
        Instr::BrFalse(_) => Instr::BrFalse(ids[target]),
        Instr::Leave(_) => Instr::Leave(ids[target]),
        other => panic!("not a jump: {:?}", other),
    };
}

#[test]
fn original_catch_at_the_end_of_the_body_keeps_its_scope() {
    let mut fx = foo_bar();
    let boom = fx.unit.method_ref(fx.unit.constructors(fx.boom)[0], None).unwrap();
    let exception = fx.unit.type_ref(fx.fw.exception).unwrap();

    // br Ltry; Lneg: -1; ret; Lok: x + 1; ret;
    // Ltry: if (x < 0) throw Boom; leave Lok; catch { pop; leave Lneg }
    let (mut body, ids) = MethodBody::from_instrs([
        Instr::Br(InstrId::default()),
        Instr::LdcI4(-1),
        Instr::Ret,
        Instr::LdArg(0),
        Instr::LdcI4(1),
        Instr::Add,
        Instr::Ret,
        Instr::LdArg(0),
        Instr::LdcI4(0),
        Instr::Clt,
        Instr::BrFalse(InstrId::default()),
        Instr::NewObj(boom),
        Instr::Throw,
        Instr::Leave(InstrId::default()),
        Instr::Pop,
        Instr::Leave(InstrId::default()),
    ]);
    retarget(&mut body, &ids, 0, 7);
    retarget(&mut body, &ids, 10, 13);
    retarget(&mut body, &ids, 13, 3);
    retarget(&mut body, &ids, 15, 1);
    body.handlers.push(ExceptionHandler {
        kind: HandlerKind::Catch(exception),
        try_start: ids[7],
        try_end: ids[14],
        handler_start: ids[14],
        handler_end: None,
    });
    with_bar_body(&mut fx, body);

    Weaver::default().weave(&mut fx.unit).unwrap();

    let recorder = Recorder::new();
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A", "Demo.B"]);
    let result = interp.call(fx.bar, vec![Value::I32(4)]).unwrap();
    assert_eq!(result.returned(), Some(Value::I32(5)));

    recorder.clear();
    let result = interp.call(fx.bar, vec![Value::I32(-3)]).unwrap();
    assert_eq!(result.returned(), Some(Value::I32(-1)));
    assert_eq!(recorder.events(), events(&["A.OnEnter", "B.OnEnter", "A.OnExit", "B.OnExit"]));
}

#[test]
fn original_regions_and_early_returns_survive_wrapping() {
    let mut fx = foo_bar();
    let boom = fx.unit.method_ref(fx.unit.constructors(fx.boom)[0], None).unwrap();
    let exception = fx.unit.type_ref(fx.fw.exception).unwrap();

    // try { if (x < 0) throw Boom; leave Lafter } catch { pop; leave Lcaught }
    // Lcaught: return -1; Lafter: if (100 < x) return 100; return x + 1;
    let (mut body, ids) = MethodBody::from_instrs([
        Instr::LdArg(0),
        Instr::LdcI4(0),
        Instr::Clt,
        Instr::BrFalse(InstrId::default()),
        Instr::NewObj(boom),
        Instr::Throw,
        Instr::Leave(InstrId::default()),
        Instr::Pop,
        Instr::Leave(InstrId::default()),
        Instr::LdcI4(-1),
        Instr::Ret,
        Instr::LdcI4(100),
        Instr::LdArg(0),
        Instr::Clt,
        Instr::BrFalse(InstrId::default()),
        Instr::LdcI4(100),
        Instr::Ret,
        Instr::LdArg(0),
        Instr::LdcI4(1),
        Instr::Add,
        Instr::Ret,
    ]);
    retarget(&mut body, &ids, 3, 6);
    retarget(&mut body, &ids, 6, 11);
    retarget(&mut body, &ids, 8, 9);
    retarget(&mut body, &ids, 14, 17);
    body.handlers.push(ExceptionHandler {
        kind: HandlerKind::Catch(exception),
        try_start: ids[0],
        try_end: ids[7],
        handler_start: ids[7],
        handler_end: Some(ids[9]),
    });
    with_bar_body(&mut fx, body);

    Weaver::default().weave(&mut fx.unit).unwrap();

    let recorder = Recorder::new();
    let mut interp = interpreter(&fx.unit, &recorder, &["Demo.A", "Demo.B"]);
    for (x, expected) in [(-3, -1), (4, 5), (500, 100)] {
        recorder.clear();
        let result = interp.call(fx.bar, vec![Value::I32(x)]).unwrap();
        assert_eq!(result.returned(), Some(Value::I32(expected)), "Bar({})", x);
        assert!(recorder.events().ends_with(&events(&["A.OnEnter", "B.OnEnter", "A.OnExit", "B.OnExit"])));
    }
}
